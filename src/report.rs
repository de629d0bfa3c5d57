//! Final run summary output.
//!
//! The narrative log already carried every state transition; this module
//! prints the closing tally with the missing tests enumerated, since the
//! exit code alone says nothing about *which* tests never passed.

use crate::scheduler::{AbortReason, Tally};

/// Prints a summary of the run to the console.
pub fn print_summary(tally: &Tally) {
    println!();
    println!("Test Results:");
    println!("  Total:     {}", tally.total);
    println!("  Succeeded: {}", console::style(tally.succeeded).green());
    println!(
        "  Remaining: {}",
        if tally.missing.is_empty() {
            console::style(0).green()
        } else {
            console::style(tally.missing.len()).red()
        }
    );
    println!("  Duration:  {:?}", tally.duration);

    if !tally.failures.is_empty() {
        println!();
        println!("Observed failures:");
        for (test, count) in &tally.failures {
            println!("  {} {}", console::style(format!("x{}", count)).yellow(), test);
        }
    }

    if let Some(AbortReason::RetryCeiling { test, failures }) = &tally.aborted {
        println!();
        println!(
            "{}",
            console::style(format!(
                "Run aborted: {} failed {} times without passing.",
                test, failures
            ))
            .red()
            .bold()
        );
    }

    if tally.passed() {
        println!();
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!();
        println!(
            "{}",
            console::style(format!("{} tests never passed:", tally.missing.len()))
                .red()
                .bold()
        );
        for test in &tally.missing {
            println!("  {}", console::style(test).red());
        }
    }
}
