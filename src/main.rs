use simulation::{simulate_counter, simulate_leader_churn, simulate_scaling};
use tracing_subscriber::EnvFilter;
pub mod simulation;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(true)
        .init();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║            WEFT CONTAINER SIMULATION                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let stats = simulate_counter(4, 100).await?;
    stats.print();

    let stats = simulate_counter(10, 200).await?;
    stats.print();

    let stats = simulate_leader_churn(8).await?;
    stats.print();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (Counter)                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    simulate_scaling(20, 5).await?;

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}
