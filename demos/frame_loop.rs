use std::thread;
use std::time::{Duration, Instant};

use tickwork::{GroupResults, Scheduler};

// -----------------------------------------------------------------------------
// A host loop at roughly 60 ticks per second.
//
// Terrain chunks are generated on the workers as one group. The level is
// "ready" once the group callback ran on the main thread. One chunk fails on
// purpose to show that failures land in the group results and in the member's
// own `on_error`.
// -----------------------------------------------------------------------------

const CHUNKS: u32 = 8;
const TICK: Duration = Duration::from_millis(16);

fn generate(seed: u32) -> anyhow::Result<u64> {
    thread::sleep(Duration::from_millis(20 + u64::from(seed % 4) * 15));
    if seed == 5 {
        anyhow::bail!("chunk {seed} hit bedrock");
    }

    Ok((0..10_000_u64).map(|x| (x * u64::from(seed + 1)) % 7).sum())
}

fn main() -> anyhow::Result<()> {
    tickwork::init_logging()?;

    let scheduler = Scheduler::builder().threads(4).thread_name("chunks").build();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    scheduler.create_group("terrain", CHUNKS as usize, false, move |results: GroupResults<u64>| {
        let mut names: Vec<_> = results.keys().cloned().collect();
        names.sort();

        for name in names {
            match &results[&name] {
                Ok(blocks) => tracing::info!(%name, blocks, "chunk ok"),
                Err(err) => tracing::warn!(%name, "chunk failed: {err}"),
            }
        }

        ready_tx.send(())?;
        Ok(())
    })?;

    for seed in 0..CHUNKS {
        scheduler.enqueue_group_task(
            format!("chunk-{seed:02}"),
            "terrain",
            move || generate(seed),
            |err| {
                tracing::warn!("retry later: {err:#}");
                Ok(())
            },
        )?;
    }

    scheduler.enqueue_sync_task(
        "hud",
        || {
            tracing::info!("hud set up on the main thread");
            Ok(())
        },
        |_| Ok(()),
    )?;

    let start = Instant::now();
    let mut tick = 0_u64;
    loop {
        tick += 1;
        let report = scheduler.drain()?;
        if report.delivered > 0 || report.groups_completed > 0 {
            tracing::info!(tick, ?report, "drain");
        }

        if ready_rx.try_recv().is_ok() {
            break;
        }

        thread::sleep(TICK);
    }

    tracing::info!(ticks = tick, elapsed = ?start.elapsed(), "level ready");
    Ok(())
}
