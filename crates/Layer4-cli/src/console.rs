//! Terminal progress output for lifecycle operations

use anvil_runtime::InitLogger;

/// Progress on stderr so stdout stays clean for command output
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleLogger;

impl InitLogger for ConsoleLogger {
    fn log_step(&self, message: &str) {
        eprintln!("==> {}", message);
    }

    fn log_stdout(&self, line: &str) {
        eprintln!("    {}", line);
    }

    fn log_stderr(&self, line: &str) {
        eprintln!("  ! {}", line);
    }

    fn log_complete(&self, exit_code: i32) {
        if exit_code == 0 {
            eprintln!("==> init hook finished");
        } else {
            eprintln!("==> init hook exited with {}", exit_code);
        }
    }
}
