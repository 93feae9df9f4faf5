#![forbid(unsafe_code)]
pub fn main() -> std::process::ExitCode {
    recover_cli::run_cli()
}
