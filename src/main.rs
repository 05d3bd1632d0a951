mod cli;
mod core;
mod logging;

use crate::cli::UsageError;
use crate::core::terminal;

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let result = tokio::select! {
        result = cli::run_main() => result,
        _ = tokio::signal::ctrl_c() => {
            terminal::print_error("Interrupted");
            std::process::exit(EXIT_FAILURE);
        }
    };

    if let Err(e) = result {
        terminal::print_error(&format!("{:#}", e));
        let code = if e.is::<UsageError>() {
            EXIT_USAGE
        } else {
            EXIT_FAILURE
        };
        std::process::exit(code);
    }
}
