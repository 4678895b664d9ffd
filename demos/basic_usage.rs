//! Basic usage example for the retransmission timer pool

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use retransmit_timers::{
    Action, CancellationToken, ConnectionRef, ConnectionTable, Disposition, Duration,
    ExpiryHandler, ExpiryRecord, ExpiryWorker, PacketRef, PacketTable, PoolConfig, TimerPool,
};

/// Retransmits packets that are still unacknowledged when their timer fires.
struct Retransmitter {
    packets: Arc<Mutex<PacketTable<String>>>,
}

#[async_trait]
impl ExpiryHandler for Retransmitter {
    async fn on_expiry(&self, record: ExpiryRecord) -> Disposition {
        let payload = record
            .packet()
            .and_then(|p| self.packets.lock().ok()?.get(p.0).cloned());

        match (record.action(), payload) {
            (Action::Retransmit, Some(payload)) => {
                println!("Slot {} expired, retransmitting '{}'", record.slot(), payload);
            }
            (Action::Retransmit, None) => {
                println!("Slot {} expired, packet already acknowledged", record.slot());
            }
            (Action::FreeTCB, _) => {
                println!("Slot {} expired, releasing connection", record.slot());
            }
        }
        Disposition::Release
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let cancel_token = CancellationToken::new();
    let packets = Arc::new(Mutex::new(PacketTable::with_key()));
    let mut connections = ConnectionTable::with_key();
    let connection = ConnectionRef(connections.insert("10.0.0.2:8080"));

    // Create timer pool with configuration
    let config = PoolConfig::default()
        .with_name("example_timer_pool")
        .with_capacity(4);
    let (pool, queue) = TimerPool::new(config, cancel_token.clone())?;

    // Spawn the worker task
    let worker = ExpiryWorker::new(
        "example_worker".to_string(),
        pool.clone(),
        queue,
        Retransmitter {
            packets: packets.clone(),
        },
        cancel_token.clone(),
    );
    let worker_task = tokio::spawn(worker.run());

    // Arm a retransmission timer per segment
    let mut armed = Vec::new();
    for (i, segment) in ["SYN", "DATA 1", "DATA 2"].into_iter().enumerate() {
        let packet = PacketRef(
            packets
                .lock()
                .map_err(|_| "packet table poisoned")?
                .insert(segment.to_string()),
        );
        let slot = pool.find_free_slot()?;
        pool.set_interval(slot, Duration::from_millis(200 * (i as u64 + 1)))?;
        pool.set_action(slot, Action::Retransmit, Some(packet), Some(connection))?;
        pool.start(slot)?;
        armed.push(packet);
    }
    println!("Timers armed! {} slot(s) left", pool.free_slots());

    // The second segment is acknowledged before its timer fires
    let acked = armed[1];
    if let Some(slot) = pool.lookup(acked) {
        pool.free(slot)?;
        println!("Segment acknowledged, timer in slot {} cancelled", slot);
    }

    // Allocation fails with backpressure once every slot is taken
    let mut held = Vec::new();
    loop {
        match pool.find_free_slot() {
            Ok(slot) => held.push(slot),
            Err(e) if e.is_backpressure() => {
                println!("Backpressure after {} extra slot(s): {}", held.len(), e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    for slot in held {
        pool.free(slot)?;
    }

    // Connection teardown timer
    let slot = pool.find_free_slot()?;
    pool.set_interval(slot, Duration::from_millis(800))?;
    pool.set_action(slot, Action::FreeTCB, None, Some(connection))?;
    pool.start(slot)?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    // Shutdown gracefully
    pool.shutdown();
    let handled = worker_task.await?;

    println!("Timer pool shut down after {} expiry record(s)!", handled);
    Ok(())
}
