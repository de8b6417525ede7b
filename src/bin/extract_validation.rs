use std::process::ExitCode;

fn main() -> ExitCode {
    shardmix::apps::init_tracing();
    match shardmix::apps::run_extract_validation(std::env::args().skip(1)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
