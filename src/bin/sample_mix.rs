use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    shardmix::apps::init_tracing();
    shardmix::apps::run_sample_mix(std::env::args().skip(1))
}
