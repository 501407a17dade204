use sha2::{Digest, Sha256};
use std::path::Path;

/// Prefix shared by every workload this tool owns.
pub const WORKLOAD_PREFIX: &str = "jupyter-kube-";

/// Number of lowercase hex characters taken from the digest.
const HASH_LEN: usize = 10;

/// A derived workload identity.
///
/// `degraded` is set when the cluster configuration file could not be read
/// and the name had to be derived from the path and the wall clock instead.
/// A degraded identity still deploys, but it will not be stable across
/// attempts, so callers log a warning and move on.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub degraded: bool,
}

/// Derives the stable per-user workload name `jupyter-kube-<hash10>`, where
/// `hash10` is the first ten lowercase hex characters of the SHA-256 digest
/// of the cluster configuration file's bytes.
///
/// The identity is a function of the file *contents* only. It is intentionally
/// independent of the user's identity and of the target namespace: two
/// machines pointed at the same cluster configuration resolve to the same
/// workload, which is what makes "reattach to existing" work.
pub fn workload_identity<P: AsRef<Path>>(cluster_config: P) -> Identity {
    let path = cluster_config.as_ref();
    match std::fs::read(path) {
        Ok(bytes) => Identity {
            name: format!("{}{}", WORKLOAD_PREFIX, hash10(&bytes)),
            degraded: false,
        },
        Err(_) => {
            // Last resort: something unique-ish so the deployment can still
            // proceed. The caller is told via `degraded`.
            let seed = format!(
                "{}|{}",
                path.display(),
                chrono::Utc::now().timestamp_millis()
            );
            Identity {
                name: format!("{}{}", WORKLOAD_PREFIX, hash10(seed.as_bytes())),
                degraded: true,
            }
        }
    }
}

fn hash10(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// The pod backing a workload. The controller is a single-replica,
/// stable-identity one, so the pod name is always the workload name with an
/// ordinal zero suffix.
pub fn pod_name(workload: &str) -> String {
    format!("{}-0", workload)
}

/// Sanitizes a user-supplied volume mount path into the path component used
/// under the notebook home directory: leading slash runs are stripped so an
/// "absolute" entry becomes relative, and an entry that sanitizes away
/// entirely lands in a generic workspace directory instead of shadowing the
/// mount root.
pub fn mount_subpath(raw: &str) -> String {
    let stripped = raw.trim().trim_start_matches('/');
    if stripped.is_empty() {
        "workspace".to_string()
    } else {
        stripped.to_string()
    }
}

/// Where a claim's sanitized path lands inside the notebook container.
pub fn mount_path(raw: &str) -> String {
    format!("/home/jovyan/main/{}", mount_subpath(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(tag: &str, contents: &[u8]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("jupyter-kube-names-test-{}-{}", std::process::id(), tag));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn identity_is_deterministic_over_contents() {
        let a = scratch_file("a", b"apiVersion: v1\nclusters: []\n");
        let b = scratch_file("b", b"apiVersion: v1\nclusters: []\n");
        let c = scratch_file("c", b"apiVersion: v1\nclusters: [prod]\n");
        let ia = workload_identity(&a);
        let ib = workload_identity(&b);
        let ic = workload_identity(&c);
        // Same bytes, different paths: same name.
        assert_eq!(ia, ib);
        assert!(!ia.degraded);
        // Different bytes: different name.
        assert_ne!(ia.name, ic.name);
        for p in [&a, &b, &c].iter() {
            let _ = std::fs::remove_file(p);
        }
    }

    #[test]
    fn identity_shape() {
        let file = scratch_file("shape", b"whatever");
        let id = workload_identity(&file);
        assert!(id.name.starts_with(WORKLOAD_PREFIX));
        let hash = &id.name[WORKLOAD_PREFIX.len()..];
        assert_eq!(hash.len(), 10);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn unreadable_config_degrades_but_still_names() {
        let id = workload_identity("/definitely/not/a/real/kubeconfig");
        assert!(id.degraded);
        assert!(id.name.starts_with(WORKLOAD_PREFIX));
        assert_eq!(id.name.len(), WORKLOAD_PREFIX.len() + 10);
    }

    #[test]
    fn pod_carries_the_stable_ordinal() {
        assert_eq!(pod_name("jupyter-kube-0a1b2c3d4e"), "jupyter-kube-0a1b2c3d4e-0");
    }

    #[test]
    fn mount_paths_are_forced_relative() {
        assert_eq!(mount_subpath("/data"), "data");
        assert_eq!(mount_subpath("//deeply/nested"), "deeply/nested");
        assert_eq!(mount_subpath("already/relative"), "already/relative");
        assert_eq!(mount_subpath("/"), "workspace");
        assert_eq!(mount_subpath(""), "workspace");
        assert_eq!(mount_path("/data"), "/home/jovyan/main/data");
    }
}
