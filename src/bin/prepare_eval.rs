use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    shardmix::apps::init_tracing();
    shardmix::apps::run_prepare_eval(std::env::args().skip(1))
}
