use super::usecases::{
    NO_ISSUES_MESSAGE, ToolError, check_code_issues, clean_output_lines, escape_single_quotes,
    validate_script_path,
};
use super::{resolve_timeout_ms, server_info};
use std::time::Duration;

#[test]
fn server_info_advertises_tools() {
    let info = server_info();
    assert!(info.capabilities.tools.is_some());
}

#[test]
fn tool_descriptions_are_distinct_and_nonempty() {
    let descriptions = [
        include_str!("../../docs/tool-descriptions/evaluate.md"),
        include_str!("../../docs/tool-descriptions/check_code.md"),
        include_str!("../../docs/tool-descriptions/run_test_file.md"),
        include_str!("../../docs/tool-descriptions/start_engine_session.md"),
        include_str!("../../docs/tool-descriptions/list_engine_environments.md"),
    ];
    for (index, description) in descriptions.iter().enumerate() {
        assert!(!description.trim().is_empty());
        for other in &descriptions[index + 1..] {
            assert_ne!(description, other);
        }
    }
}

#[test]
fn default_timeout_applies_when_unset() {
    assert_eq!(
        resolve_timeout_ms(None).expect("default"),
        super::usecases::DEFAULT_EVAL_TIMEOUT
    );
    assert_eq!(
        resolve_timeout_ms(Some(1500)).expect("explicit"),
        Duration::from_millis(1500)
    );
}

#[test]
fn zero_timeout_is_rejected() {
    assert!(resolve_timeout_ms(Some(0)).is_err());
}

#[test]
fn empty_script_path_is_rejected() {
    assert!(matches!(
        validate_script_path(""),
        Err(ToolError::InvalidPath(_))
    ));
    assert!(matches!(
        validate_script_path("   "),
        Err(ToolError::InvalidPath(_))
    ));
}

#[test]
fn wrong_extension_is_rejected() {
    assert!(matches!(
        validate_script_path("analysis.txt"),
        Err(ToolError::InvalidPath(_))
    ));
}

#[test]
fn missing_script_surfaces_the_io_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = temp.path().join("not-there.m");
    assert!(matches!(
        validate_script_path(&missing.to_string_lossy()),
        Err(ToolError::Io(_))
    ));
}

#[test]
fn existing_script_is_absolutised() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = temp.path().join("analysis.m");
    std::fs::write(&script, "x = 1;\n").expect("write script");

    let validated =
        validate_script_path(&script.to_string_lossy()).expect("valid script path");
    assert!(validated.is_absolute());
    assert!(validated.ends_with("analysis.m"));
}

#[test]
fn directories_are_not_scripts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("pkg.m");
    std::fs::create_dir(&dir).expect("create dir");
    assert!(matches!(
        validate_script_path(&dir.to_string_lossy()),
        Err(ToolError::InvalidPath(_))
    ));
}

#[test]
fn single_quotes_are_doubled_for_engine_literals() {
    assert_eq!(
        escape_single_quotes("/tmp/o'brien/script.m"),
        "/tmp/o''brien/script.m"
    );
    assert_eq!(escape_single_quotes("plain"), "plain");
}

#[test]
fn analyzer_output_is_split_into_trimmed_lines() {
    let output = "  Line 1: Warning  \n\n  \n\nLine 3: Error\n   \n";
    assert_eq!(
        clean_output_lines(output),
        vec!["Line 1: Warning".to_string(), "Line 3: Error".to_string()]
    );
    assert_eq!(
        check_code_issues(output),
        vec!["Line 1: Warning".to_string(), "Line 3: Error".to_string()]
    );
}

#[test]
fn empty_analyzer_output_reports_no_issues() {
    assert_eq!(check_code_issues(""), vec![NO_ISSUES_MESSAGE.to_string()]);
    assert_eq!(
        check_code_issues("  \n   \n"),
        vec![NO_ISSUES_MESSAGE.to_string()]
    );
}
