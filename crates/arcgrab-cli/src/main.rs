use arcgrab_core::logging;

mod cli;

#[tokio::main]
async fn main() {
    logging::init_stderr();
    std::process::exit(cli::run_from_args().await);
}
