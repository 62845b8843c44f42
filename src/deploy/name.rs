use crate::error::DeployError;

pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Tool names are 1-64 characters of `[A-Za-z0-9._-]`, starting with an
/// alphanumeric character.
pub fn validate_tool_name(name: &str) -> Result<(), DeployError> {
    let invalid = |reason: &str| DeployError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(invalid("name is longer than 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid(
            "name must contain only letters, digits, '.', '_' or '-'",
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid("name must start with a letter or digit"));
    }
    if name.contains("..") {
        return Err(invalid("name must not contain '..'"));
    }
    Ok(())
}
