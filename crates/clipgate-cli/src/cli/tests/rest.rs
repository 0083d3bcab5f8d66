use super::*;

#[test]
fn status_with_json() {
    match parse(&["clipgate", "status", "12", "--json"]) {
        CliCommand::Status { id, json } => {
            assert_eq!(id, 12);
            assert!(json);
        }
        _ => panic!("expected Status"),
    }
}

#[test]
fn status_rejects_non_numeric_id() {
    assert!(Cli::try_parse_from(["clipgate", "status", "abc"]).is_err());
}

#[test]
fn list_without_filter() {
    match parse(&["clipgate", "list"]) {
        CliCommand::List { status } => assert!(status.is_none()),
        _ => panic!("expected List"),
    }
}

#[test]
fn list_filtered_by_status() {
    match parse(&["clipgate", "list", "--status", "failed"]) {
        CliCommand::List { status } => assert_eq!(status, Some(JobStatus::Failed)),
        _ => panic!("expected List"),
    }
}

#[test]
fn list_rejects_unknown_status() {
    assert!(Cli::try_parse_from(["clipgate", "list", "--status", "paused"]).is_err());
}

#[test]
fn stats_json() {
    match parse(&["clipgate", "stats", "--json"]) {
        CliCommand::Stats { json } => assert!(json),
        _ => panic!("expected Stats"),
    }
}

#[test]
fn cancel_id() {
    match parse(&["clipgate", "cancel", "3"]) {
        CliCommand::Cancel { id } => assert_eq!(id, 3),
        _ => panic!("expected Cancel"),
    }
}

#[test]
fn completions_shell() {
    match parse(&["clipgate", "completions", "bash"]) {
        CliCommand::Completions { shell } => assert_eq!(shell, Shell::Bash),
        _ => panic!("expected Completions"),
    }
}

#[test]
fn manpage() {
    assert!(matches!(parse(&["clipgate", "manpage"]), CliCommand::Manpage));
}

#[test]
fn command_definition_is_consistent() {
    Cli::command().debug_assert();
}
