/// Serde helper for `#[serde(default = "docform_model::serde_defaults::default_true")]`.
pub const fn default_true() -> bool {
    true
}

pub fn is_false(v: &bool) -> bool {
    !*v
}
