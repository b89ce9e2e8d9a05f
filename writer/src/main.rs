use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use shmq::backoff::backoff;
use shmq::{ChannelConfig, Queue, Waiter};

#[derive(Parser)]
struct Opts {
    #[arg(short, long, default_value = "shmq-writer.toml")]
    config: String,
    /// Messages to push before exiting.
    #[arg(short = 'n', long, default_value_t = 1_000_000)]
    count: u64,
    /// Evict stalled readers instead of giving up on a full ring.
    #[arg(long)]
    force: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct WriterConfig {
    channel: ChannelConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    let name = cfg.channel.qualified();

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let mut queue: Queue<u64> = Queue::open(&name)?;
    queue.ready_sending();
    let waiter = Waiter::open(&name)?;

    println!("pushing {} messages to {:?}", opts.count, name);
    let start = Instant::now();
    let mut pushed = 0u64;
    let mut k = 0u32;
    while pushed < opts.count && !stop.load(Ordering::Relaxed) {
        let ok = if opts.force {
            queue.force_push(pushed)
        } else {
            queue.push(pushed)
        };
        if ok {
            pushed += 1;
            k = 0;
            waiter.notify()?;
        } else {
            // ring full or no reader yet
            backoff(&mut k);
        }
    }
    waiter.broadcast()?;
    queue.shut_sending();

    let duration = start.elapsed();
    let iops = (pushed as f64) / (duration.as_millis().max(1) as f64) * 1_000f64;
    println!(
        "IOPS : {:#?}K, time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
