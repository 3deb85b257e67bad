use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match content_sync::cli::run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(content_sync::errors::get_exit_code(&e))
        }
    }
}
