pub mod backends;
pub mod check;
pub mod host;
pub mod version;

pub(crate) fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}
