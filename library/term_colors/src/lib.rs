//! Convenience functions for coloring values interpolated into log entries.
//!
//! Convention across the workspace: `cyan` for object names (workloads,
//! pods, secrets), `green`/`red` for good/bad states, `orange` for elapsed
//! durations, `bold` for user-facing remediation hints.

use ansi_term::ANSIGenericString;
use std::borrow::Cow;

macro_rules! color_fns {
    ($($name:ident => $color:expr;)*) => {
        $(
            pub fn $name<'a, I, S: 'a + ToOwned + ?Sized>(input: I) -> ANSIGenericString<'a, S>
            where
                I: Into<Cow<'a, S>>,
                <S as ToOwned>::Owned: std::fmt::Debug,
            {
                $color.paint(input)
            }
        )*
    };
}

color_fns! {
    cyan => ansi_term::Color::Cyan;
    green => ansi_term::Color::Green;
    red => ansi_term::Color::Red;
    yellow => ansi_term::Color::Yellow;
    orange => ansi_term::Color::RGB(243, 113, 33);
}

pub fn bold<'a, I, S: 'a + ToOwned + ?Sized>(input: I) -> ANSIGenericString<'a, S>
where
    I: Into<Cow<'a, S>>,
    <S as ToOwned>::Owned: std::fmt::Debug,
{
    ansi_term::Style::new().bold().paint(input)
}
