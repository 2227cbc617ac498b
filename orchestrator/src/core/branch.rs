//! Sandbox branch naming and validation.

/// Derived branch name when the run record does not carry one.
pub fn run_branch_for(run_id: &str) -> String {
    format!("run-{run_id}")
}

/// Characters git refuses in ref names that we reject outright.
const FORBIDDEN_CHARS: &[char] = &['~', '^', ':', '?', '*', '['];

/// Validate a sandbox branch name before any repository mutation.
///
/// Rejects whitespace, `..`, leading/trailing `/`, a trailing `.lock`, and
/// the git-special characters `~^:?*[`. This is stricter than a full
/// `check-ref-format` but covers every name the trigger path may supply.
pub fn validate_branch_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("branch name must not be empty".to_string());
    }
    if name.chars().any(char::is_whitespace) {
        return Err(format!("branch name '{name}' contains whitespace"));
    }
    if name.contains("..") {
        return Err(format!("branch name '{name}' contains '..'"));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(format!("branch name '{name}' starts or ends with '/'"));
    }
    if name.ends_with(".lock") {
        return Err(format!("branch name '{name}' ends with '.lock'"));
    }
    if let Some(ch) = name.chars().find(|ch| FORBIDDEN_CHARS.contains(ch)) {
        return Err(format!("branch name '{name}' contains '{ch}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_slashed_names() {
        assert!(validate_branch_name("feat/oauth-login").is_ok());
        assert!(validate_branch_name("run-20260829-abc123").is_ok());
        assert!(validate_branch_name("fix_1.2").is_ok());
    }

    #[test]
    fn rejects_git_special_names() {
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("has space").is_err());
        assert!(validate_branch_name("a\tb").is_err());
        assert!(validate_branch_name("a..b").is_err());
        assert!(validate_branch_name("/leading").is_err());
        assert!(validate_branch_name("trailing/").is_err());
        assert!(validate_branch_name("ref.lock").is_err());
        assert!(validate_branch_name("feat/*broken").is_err());
        assert!(validate_branch_name("a~b").is_err());
        assert!(validate_branch_name("a^b").is_err());
        assert!(validate_branch_name("a:b").is_err());
        assert!(validate_branch_name("a?b").is_err());
        assert!(validate_branch_name("a[b").is_err());
    }

    #[test]
    fn derived_branch_is_always_valid() {
        let branch = run_branch_for("20260829_120000-x1y2z3");
        assert!(validate_branch_name(&branch).is_ok());
    }
}
