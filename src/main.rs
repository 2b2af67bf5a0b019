//! Demo capture session against the simulated card

use std::sync::Arc;

use color_eyre::Result;
use tracing::{info, warn};

use deckstream::sim::{sim_handle, sim_profile, SimCard};
use deckstream::{
    Browser, Config, DeckCommand, Device, DeviceEvent, DisplayMode, LinkDirection, PixelFormat,
    StreamRequest, VideoFormat,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deckstream=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("deckstream demo starting");

    let config = Config::load(None)?;

    // Explicit registry: the simulated card stands in for the vendor SDK.
    let browser = Browser::new();
    let card = Arc::new(SimCard::new());
    card.deck_script().set_locked(true);
    browser.attach(sim_handle(), sim_profile(), card);

    let handle = browser
        .enumerate()
        .into_iter()
        .next()
        .expect("simulated card is attached");
    info!("using device: {}", handle.display_name);

    let mut device = Device::open(&browser, &handle, config)?;
    device.configure(StreamRequest {
        video: VideoFormat::new(DisplayMode::Ntsc, PixelFormat::Yuv8),
        audio: None,
        direction: LinkDirection::Capture,
    })?;

    let frames = device.frames()?;
    let events = device.events();
    device.start()?;

    // Consumer task: read timecodes, release buffers back to the pool.
    let consumer = tokio::spawn(async move {
        let mut received: u64 = 0;
        while let Ok(frame) = frames.recv_async().await {
            if let Some(meta) = frame.buffer.metadata() {
                if received % 30 == 0 {
                    info!(timecode = %meta.timecode, sequence = meta.sequence, "frame");
                }
            }
            received += 1;
            frame.buffer.release();
        }
        received
    });

    // Event task: surface drops and faults.
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                DeviceEvent::Stream(e) => warn!(?e, "stream event"),
                DeviceEvent::Deck(e) => info!(?e, "deck event"),
            }
        }
    });

    // Drive the deck alongside the capture stream.
    device.engage_deck_control()?;
    device.pump_deck_status()?;
    device.send_deck_command(DeckCommand::Play)?;

    info!("capturing; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    device.send_deck_command(DeckCommand::Stop)?;
    device.disengage_deck_control()?;
    device.stop()?;
    device.close()?;

    let received = consumer.await?;
    info!(frames = received, "deckstream shutting down");
    Ok(())
}
