//! CLI smoke entry point.
//!
//! Prints core linkage info and, given a database path, the number of stored
//! languages.

use langrepo_core::db::{open_db, open_db_in_memory};
use langrepo_core::{Criteria, LanguageRepository, SqliteLanguageRepository};
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("langrepo_core ping={}", langrepo_core::ping());
    println!("langrepo_core version={}", langrepo_core::core_version());

    let opened = match std::env::args().nth(1) {
        Some(path) => open_db(path),
        None => open_db_in_memory(),
    };
    let conn = match opened {
        Ok(conn) => conn,
        Err(err) => {
            eprintln!("failed to open database: {err}");
            return ExitCode::FAILURE;
        }
    };

    let repo = SqliteLanguageRepository::from_connection(&conn);
    let counted = repo
        .match_criteria(&Criteria::new())
        .and_then(|mut matches| matches.try_fold(0_usize, |count, item| item.map(|_| count + 1)));
    match counted {
        Ok(count) => {
            println!("langrepo_core languages={count}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to list languages: {err} (code {})", err.code());
            ExitCode::FAILURE
        }
    }
}
