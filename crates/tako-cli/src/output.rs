//! Human-facing output: run reports, summaries, and error lines.

use tako_engine::{RepoResult, RunReport};

/// Print the per-repository outcome of a run.
pub fn print_report(report: &RunReport, summarize_errors: bool) {
    for result in &report.results {
        let label = match &result.workflow {
            Some(workflow) => format!("{} ({workflow})", result.repo),
            None => result.repo.clone(),
        };
        if result.ok {
            println!("ok   {label}");
        } else {
            let error = result.error.as_deref().unwrap_or("unknown error");
            println!("FAIL {label}: {error}");
        }
    }

    let failures = report.failures();
    if summarize_errors && !failures.is_empty() {
        println!();
        println!("failures:");
        for failure in &failures {
            print_failure(failure);
        }
    }

    if report.ok() {
        println!("run {} completed", report.run_id);
    } else {
        println!("run {} failed ({} failures)", report.run_id, failures.len());
    }
}

fn print_failure(result: &RepoResult) {
    let workflow = result.workflow.as_deref().unwrap_or("-");
    let error = result.error.as_deref().unwrap_or("unknown error");
    println!("  {}  workflow={workflow}  {error}", result.repo);
}

/// One error line per failure: stable code, then the human message.
pub fn print_error(code: tako_core::ErrorCode, message: &str) {
    eprintln!("{code}: {message}");
}
