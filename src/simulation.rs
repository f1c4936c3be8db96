use async_stream::stream;
use chrono::Local;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use weft_sdk::client::quick::{create_connected_clients, create_task_clients};
use weft_sdk::prelude::*;
use weft_sdk::{default_registry, Result};

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub name: &'static str,
    pub num_clients: usize,
    pub operations_per_client: usize,
    pub sequenced_messages: u64,
    pub leader_changes: usize,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub ops_per_second: f64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║  {:<58}║", self.name);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Clients:                   {:>30} ║", self.num_clients);
        println!("║  Operations per Client:     {:>30} ║", self.operations_per_client);
        println!("║  Sequenced Messages:        {:>30} ║", self.sequenced_messages);
        println!("║  Leader Changes:            {:>30} ║", self.leader_changes);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>28}µs ║", self.avg_sync_time.as_micros());
        println!("║  Operations/Second:         {:>30.0} ║", self.ops_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Generator of (client index, increment) pairs
fn increment_generator(num_clients: usize, num_ops: usize) -> impl Stream<Item = (usize, i64)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..num_ops {
            let client = rng.gen_range(0..num_clients);
            let amount = rng.gen_range(-5..=10);
            yield (client, amount);
        }
    }
}

fn user_names(num_clients: usize) -> Vec<String> {
    (0..num_clients).map(|i| format!("client-{}", i)).collect()
}

fn mismatch(what: impl Into<String>) -> SdkError {
    SdkError::Internal(what.into())
}

/// Random increments on one shared counter from every client, then a
/// convergence check and a save/load round trip.
pub async fn simulate_counter(num_clients: usize, ops_per_client: usize) -> Result<SimulationStats> {
    println!("\n[{}] Counter convergence: {} clients x {} ops",
             Local::now().format("%H:%M:%S"), num_clients, ops_per_client);

    let start = Instant::now();
    let orderer = MemoryOrderer::new();
    let names = user_names(num_clients);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let clients = create_connected_clients(&orderer, &names).await?;

    let shared = clients[0].create_counter("shared").await?;
    for client in &clients {
        client.sync().await?;
    }
    let mut counters = Vec::with_capacity(num_clients);
    for client in &clients {
        counters.push(client.get_channel("shared").await?);
    }

    println!("[Phase 1/3] Submitting increments...");
    let mut expected = 0i64;
    let mut sync_times = Vec::new();
    let mut increments = Box::pin(increment_generator(num_clients, num_clients * ops_per_client));
    let mut submitted = 0usize;
    while let Some((idx, amount)) = increments.next().await {
        as_counter(&counters[idx])?.increment(amount)?;
        expected += amount;
        submitted += 1;

        if submitted % 100 == 0 {
            let sync_start = Instant::now();
            clients[idx].sync().await?;
            sync_times.push(sync_start.elapsed());
            debug!(submitted, "Increments submitted");
        }
    }
    println!("[Phase 1/3] ✓ Completed");

    println!("[Phase 2/3] Waiting for convergence...");
    for client in &clients {
        let sync_start = Instant::now();
        client.sync().await?;
        sync_times.push(sync_start.elapsed());
    }
    for (client, counter) in clients.iter().zip(&counters) {
        let value = as_counter(counter)?.value();
        if value != expected {
            return Err(mismatch(format!(
                "{} diverged: {} != {}",
                client.user_name(),
                value,
                expected
            )));
        }
    }
    println!("[Phase 2/3] ✓ Completed (value = {})", expected);

    println!("[Phase 3/3] Save and reload...");
    clients[0].save()?;
    let reloaded = Client::load(ClientConfig::default(), orderer.clone(), Arc::new(default_registry())).await?;
    let copy = reloaded.get_channel("shared").await?;
    if as_counter(&copy)?.value() != as_counter(&shared)?.value() {
        return Err(mismatch("reloaded document diverged"));
    }
    println!("[Phase 3/3] ✓ Completed");

    let total_time = start.elapsed();
    let avg_sync_time = if !sync_times.is_empty() {
        sync_times.iter().sum::<Duration>() / sync_times.len() as u32
    } else {
        Duration::ZERO
    };

    Ok(SimulationStats {
        name: "Counter Convergence",
        num_clients,
        operations_per_client: ops_per_client,
        sequenced_messages: orderer.sequence_number(),
        leader_changes: 0,
        total_time,
        avg_sync_time,
        ops_per_second: submitted as f64 / total_time.as_secs_f64(),
    })
}

/// Disconnect the current leader until one client is left, checking that
/// leadership always lands on the lowest remaining interactive client.
pub async fn simulate_leader_churn(num_clients: usize) -> Result<SimulationStats> {
    println!("\n[{}] Leader churn: {} clients",
             Local::now().format("%H:%M:%S"), num_clients);

    let start = Instant::now();
    let orderer = MemoryOrderer::new();
    let names = user_names(num_clients);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let clients = create_task_clients(&orderer, &names, &["index"]).await?;

    let mut sync_times = Vec::new();
    let mut leader_changes = 0;
    for round in 0..num_clients {
        for client in clients.iter().skip(round) {
            let sync_start = Instant::now();
            client.sync().await?;
            sync_times.push(sync_start.elapsed());
        }

        let leader = &clients[round];
        let leader_id = leader.client_id();
        for client in clients.iter().skip(round) {
            if client.runtime().leader() != leader_id {
                return Err(mismatch(format!(
                    "{} follows {:?}, expected {:?}",
                    client.user_name(),
                    client.runtime().leader(),
                    leader_id
                )));
            }
        }
        leader_changes += 1;
        info!(round, leader = ?leader_id, "Leader agreed");

        if round + 1 < num_clients {
            leader.disconnect().await?;
        }
    }

    let total_time = start.elapsed();
    let avg_sync_time = if !sync_times.is_empty() {
        sync_times.iter().sum::<Duration>() / sync_times.len() as u32
    } else {
        Duration::ZERO
    };

    Ok(SimulationStats {
        name: "Leader Churn",
        num_clients,
        operations_per_client: 0,
        sequenced_messages: orderer.sequence_number(),
        leader_changes,
        total_time,
        avg_sync_time,
        ops_per_second: leader_changes as f64 / total_time.as_secs_f64(),
    })
}

/// Counter convergence at increasing client counts
pub async fn simulate_scaling(max_clients: usize, step_size: usize) -> Result<()> {
    let mut current_clients = step_size;
    while current_clients <= max_clients {
        let stats = simulate_counter(current_clients, 50).await?;
        stats.print();
        current_clients += step_size;
    }
    Ok(())
}
