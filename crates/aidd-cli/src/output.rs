use serde::Serialize;

/// Conventional exit codes shared by every subcommand.
pub const EXIT_OK: i32 = 0;
pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_CONTINUE: i32 = 10;
pub const EXIT_BLOCKED: i32 = 20;
pub const EXIT_RUNTIME: i32 = 30;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Print a validator error list one per line. Returns the exit code to use.
pub fn report_errors(label: &str, errors: &[String]) -> i32 {
    if errors.is_empty() {
        return EXIT_OK;
    }
    for error in errors {
        eprintln!("{label}: {error}");
    }
    EXIT_VALIDATION
}

/// Map a loop status string to its exit code.
pub fn status_exit_code(status: &str) -> i32 {
    match status {
        "done" | "ok" => EXIT_OK,
        "continue" | "warn" => EXIT_CONTINUE,
        "blocked" => EXIT_BLOCKED,
        _ => EXIT_RUNTIME,
    }
}
