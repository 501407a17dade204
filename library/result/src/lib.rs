use error::JkError;

/// A Result is an alias of [std::result::Result](std::result::Result) with
/// the error variant pre-populated with a `Box<dyn JkError>`. It keeps
/// signatures short and makes it obvious which functions still return raw
/// library errors that have yet to be mapped into the workspace taxonomy.
///
/// ```
/// use error::JkError;
/// use result::Result;
///
/// fn derive_name() -> Result<&'static str> {
///     Ok("jupyter-kube-0a1b2c3d4e")
/// }
/// ```
pub type Result<T> = std::result::Result<T, Box<dyn JkError>>;
