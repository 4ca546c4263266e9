/// Stage names become checkpoint directory components, so the alphabet
/// is restricted to characters that are safe on every filesystem.
pub fn validate_stage_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("stage name must be non-empty".to_string());
    }
    if name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "stage name `{name}` must use only ASCII letters, digits, '-' or '_'"
    ))
}
