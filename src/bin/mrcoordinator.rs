use std::{env, time::Duration};

use minimr::mr::coordinator::{self, Coordinator};
use minimr::mr::protocol;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = env::args().collect::<Vec<String>>();
    if args.len() < 3 {
        println!("Usage: cargo run --bin mrcoordinator -- <reduce task number> <input files ...>");
        return Ok(());
    }

    let n_reduce = args[1].parse::<usize>()?;
    let inputs = args[2..].to_vec();

    println!(
        "[Coordinator Configuration] #{} Map Tasks | #{} Reduce Partitions",
        inputs.len(),
        n_reduce
    );

    let coordinator = Coordinator::new(inputs, n_reduce);
    let socket = protocol::socket_path();

    let listener = coordinator::bind(&socket).await?;
    println!(
        "[Job] The coordinator is serving on {}, launch worker processes to begin",
        socket.display()
    );
    tokio::spawn(coordinator::serve(listener, coordinator.clone()));

    // Poll until the job has run through both phases
    while !coordinator.done() {
        sleep(Duration::from_secs(1)).await;
    }

    println!("\nThe MapReduce job has finished, please check the results at `mr-out-*`");
    let _ = tokio::fs::remove_file(&socket).await;

    Ok(())
}
