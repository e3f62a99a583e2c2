use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use structopt::StructOpt;
use tokio::net::TcpListener;

use taskgrid::server::core::CoreRef;
use taskgrid::server::rpc::{client_connection_initiator, worker_connection_initiator};
use taskgrid::util::setup_interrupt;

#[derive(Debug, StructOpt)]
#[structopt(name = "taskgrid-scheduler", about = "Distributed DAG task scheduler")]
struct Opt {
    #[structopt(long, default_value = "7070")]
    worker_port: u16,
    #[structopt(long, default_value = "7071")]
    client_port: u16,
    /// How long a submission waits for the first worker, in milliseconds
    #[structopt(long, default_value = "15000")]
    worker_wait_ms: u64,
}

fn setup_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::builder().format_timestamp_millis().init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> taskgrid::Result<()> {
    let opt = Opt::from_args();
    setup_logging();
    log::info!("taskgrid scheduler v0.1 started: {:?}", opt);

    let mut end_rx = setup_interrupt();
    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();

    let worker_address = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), opt.worker_port);
    let worker_listener = TcpListener::bind(worker_address).await?;
    log::info!("Listening for workers on {}", worker_address);

    let client_address = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), opt.client_port);
    let client_listener = TcpListener::bind(client_address).await?;
    log::info!("Listening for clients on {}", client_address);

    let core_ref = CoreRef::with_worker_wait(Duration::from_millis(opt.worker_wait_ms));
    core_ref.get_mut().set_stop_sender(stop_tx);

    let task_set = tokio::task::LocalSet::default();
    task_set
        .run_until(async move {
            let workers = worker_connection_initiator(worker_listener, core_ref.clone());
            let clients = client_connection_initiator(client_listener, core_ref);
            let end_flag = async move {
                tokio::select! {
                    _ = end_rx.recv() => {}
                    _ = stop_rx.recv() => {}
                }
                Ok::<(), taskgrid::TgError>(())
            };

            tokio::select! {
                r = workers => r,
                r = clients => r,
                r = end_flag => r,
            }
        })
        .await?;

    log::info!("taskgrid scheduler ends");
    Ok(())
}
