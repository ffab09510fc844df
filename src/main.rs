use colored::Colorize;

fn main() {
    let code = match nas_wake_sync::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            nas_wake_sync::error_exit_code(&err)
        }
    };
    std::process::exit(code);
}
