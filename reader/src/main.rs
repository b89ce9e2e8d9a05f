use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use shmq::{ChannelConfig, Queue, Waiter};

#[derive(Parser)]
struct Opts {
    #[arg(short, long, default_value = "shmq-reader.toml")]
    config: String,
    /// Messages to consume before exiting.
    #[arg(short = 'n', long, default_value_t = 1_000_000)]
    count: u64,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ReaderConfig {
    channel: ChannelConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    let name = cfg.channel.qualified();

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let mut queue: Queue<u64> = Queue::open(&name)?;
    if !queue.connect() {
        return Err(format!(
            "channel {:?} already carries its maximum number of readers",
            name
        )
        .into());
    }
    let waiter = Waiter::open(&name)?;

    println!("consuming {} messages from {:?}", opts.count, name);
    let start = Instant::now();
    let mut received = 0u64;
    let mut last_seen = 0u64;
    while received < opts.count && !stop.load(Ordering::Relaxed) {
        // park until the writer publishes or the poll interval elapses
        waiter.wait_if(|| queue.empty() && !stop.load(Ordering::Relaxed), 100)?;
        while let Some(value) = queue.pop() {
            received += 1;
            last_seen = value;
            if received % 100_000 == 0 {
                println!("{}, {}", received, last_seen);
            }
        }
        if !queue.connected() {
            println!("evicted by the writer after {} messages", received);
            break;
        }
    }
    queue.disconnect();

    let duration = start.elapsed();
    let iops = (received as f64) / (duration.as_millis().max(1) as f64) * 1_000f64;
    println!(
        "IOPS : {:#?}K, time: {:#?}, last: {}",
        (iops / 1000f64) as u64,
        duration,
        last_seen
    );
    Ok(())
}
