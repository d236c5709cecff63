mod tracing_helper;

use std::env;

use anyhow::{Context, Result};
use tokio::{select, signal};
use tracing::info;
use viewlink_lib::{
    config::ViewerConfig,
    session::{peer_session::RtcPeerSessionFactory, SessionHandle, SignalingChannel},
};

#[tokio::main]
async fn main() -> Result<()> {
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| concat!(env!("CARGO_PKG_NAME"), ".toml").to_owned());
    let config = ViewerConfig::load(&path)?;
    tracing_helper::init_tracing(
        &config.log_dir,
        concat!(env!("CARGO_PKG_NAME"), ".log"),
        true,
    )?;

    let endpoint = config.endpoint_url()?;
    info!(
        "connecting to {}://{}{}",
        endpoint.scheme(),
        endpoint.host_str().unwrap_or_default(),
        endpoint.path()
    );
    let channel = SignalingChannel::connect(endpoint.into());
    let factory = RtcPeerSessionFactory::new(config.ice_failed_timeout());
    let mut session = SessionHandle::spawn(channel, factory, config.media_directions());

    let mut status_rx = session.subscribe_status();
    let mut media_rx = session
        .take_remote_media()
        .context("Remote media already taken")?;
    println!("status: {}", session.status());
    loop {
        select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                println!("status: {}", status);
            }
            Some(media) = media_rx.recv() => {
                println!(
                    "receiving {:?} track {} (ice servers: {})",
                    media.kind(),
                    media.track_id(),
                    session.ice_server_count()
                );
            }
            result = signal::ctrl_c() => {
                result?;
                info!("interrupted");
                session.teardown();
                break;
            }
        }
    }
    session.join().await?;
    println!("status: {}", *status_rx.borrow());
    Ok(())
}
