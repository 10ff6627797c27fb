use minimr::mr::function::wc;
use minimr::mr::protocol;
use minimr::mr::worker::{self, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let socket = protocol::socket_path();

    // Connect to the coordinator's socket
    let client = match worker::connect(&socket).await {
        Ok(client) => client,
        Err(e) => {
            println!(
                "[Worker] Failed to reach the coordinator at {}, please check that it is running\nError Message: {}",
                socket.display(),
                e
            );
            return Ok(());
        }
    };

    let worker = Worker::new(wc::map, wc::reduce);
    println!("[Worker] Worker {} connected, asking for work", worker.id());

    worker.run(&client).await
}
