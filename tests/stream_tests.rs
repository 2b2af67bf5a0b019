//! End-to-end scenarios against the simulated card

use std::sync::Arc;
use std::time::Duration;

use deckstream::sim::{sim_handle, sim_profile, SimCard};
use deckstream::{
    Browser, Capability, Config, DeckCommand, Device, DeviceError, DeviceEvent, DisplayMode,
    DropReason, EngineState, FrameMetadata, LinkDirection, PixelFormat, StreamEvent, StreamRequest,
    Timecode, TimecodeSource, TransportState, VideoFormat,
};
use deckstream::frame::FrameFlags;
use deckstream::hal::DriverEvent;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn open_sim(config: Config) -> (Device, Arc<SimCard>) {
    let browser = Browser::new();
    let card = Arc::new(SimCard::new());
    let driver: Arc<SimCard> = Arc::clone(&card);
    browser.attach(sim_handle(), sim_profile(), driver);
    let device = Device::open(&browser, &sim_handle(), config).unwrap();
    (device, card)
}

fn capture_request() -> StreamRequest {
    StreamRequest {
        video: VideoFormat::new(DisplayMode::Ntsc, PixelFormat::Yuv8)
            .with_timecode_source(TimecodeSource::Rp188),
        audio: None,
        direction: LinkDirection::Capture,
    }
}

fn ntsc_timecode(index: u64) -> Timecode {
    Timecode::from_frame_index(index, &deckstream::format::FrameRate::new(30000, 1001), true)
}

fn frame_event(index: u64) -> DriverEvent {
    DriverEvent::Frame {
        video: vec![index as u8; 64],
        audio: None,
        hardware_timecode: Some(ntsc_timecode(index)),
        flags: FrameFlags::default(),
    }
}

/// Wait for a stream event matching the predicate, ignoring others.
fn wait_for_event(
    events: &flume::Receiver<DeviceEvent>,
    mut pred: impl FnMut(&StreamEvent) -> bool,
) -> StreamEvent {
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .expect("timed out waiting for stream event");
        if let Ok(DeviceEvent::Stream(event)) = events.recv_timeout(remaining) {
            if pred(&event) {
                return event;
            }
        }
    }
}

#[test]
fn unsupported_format_leaves_device_untouched() {
    let (mut device, _card) = open_sim(Config::default());

    let bad = StreamRequest {
        video: VideoFormat::new(DisplayMode::Uhd2160p2997, PixelFormat::Rgb10),
        audio: None,
        direction: LinkDirection::Capture,
    };
    assert!(matches!(
        device.configure(bad),
        Err(DeviceError::UnsupportedFormat(_))
    ));
    // no partial mutation: still unconfigured, and a valid configure works
    assert_eq!(device.engine_state(), EngineState::Idle);
    assert!(matches!(
        device.start(),
        Err(DeviceError::InvalidSequence(_))
    ));
    device.configure(capture_request()).unwrap();
    assert_eq!(device.engine_state(), EngineState::Configured);
}

#[test]
fn captured_metadata_round_trips_unchanged() {
    let (mut device, card) = open_sim(Config::default());
    let script = card.script_link();
    device.configure(capture_request()).unwrap();
    let frames = device.frames().unwrap();
    device.start().unwrap();

    script.send(frame_event(7)).unwrap();

    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    let meta = frame.buffer.metadata().unwrap().clone();
    assert_eq!(meta.sequence, 0);
    assert_eq!(meta.timecode, ntsc_timecode(7));
    assert!(meta.timecode.drop_frame);
    assert_eq!(meta.flags, FrameFlags::default());
    assert!(meta.hdr.is_none());
    // payload made it across the ownership transfer too
    assert!(frame.buffer.payload()[..64].iter().all(|b| *b == 7));
    frame.buffer.release();

    device.close().unwrap();
}

#[test]
fn negotiated_audio_rides_the_frame_cadence() {
    let (mut device, card) = open_sim(Config::default());
    let script = card.script_link();

    let audio = deckstream::AudioFormat {
        sample_rate: 48000,
        channels: 2,
        sample_type: deckstream::format::AudioSampleType::Int16,
    };
    let unsupported = deckstream::AudioFormat {
        sample_rate: 44100,
        ..audio
    };
    assert!(matches!(
        device.configure(StreamRequest {
            audio: Some(unsupported),
            ..capture_request()
        }),
        Err(DeviceError::UnsupportedFormat(_))
    ));

    device
        .configure(StreamRequest {
            audio: Some(audio),
            ..capture_request()
        })
        .unwrap();
    let frames = device.frames().unwrap();
    device.start().unwrap();

    script
        .send(DriverEvent::Frame {
            video: vec![1; 64],
            audio: Some(vec![0x55; 1602 * 2 * 2]),
            hardware_timecode: Some(ntsc_timecode(0)),
            flags: FrameFlags::default(),
        })
        .unwrap();

    let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
    let block = frame.audio.as_deref().unwrap();
    assert_eq!(block.len(), 1602 * 2 * 2);
    assert!(block.iter().all(|b| *b == 0x55));
    frame.buffer.release();

    device.close().unwrap();
}

#[test]
fn delivery_order_is_strictly_monotonic() {
    let (mut device, card) = open_sim(Config::default());
    let script = card.script_link();
    device.configure(capture_request()).unwrap();
    let frames = device.frames().unwrap();
    let events = device.events();
    device.start().unwrap();

    for index in [0, 1, 1, 2] {
        script.send(frame_event(index)).unwrap();
    }

    let dropped = wait_for_event(&events, |e| matches!(e, StreamEvent::FrameDropped { .. }));
    assert!(matches!(
        dropped,
        StreamEvent::FrameDropped {
            reason: DropReason::OutOfOrder,
            ..
        }
    ));

    let rate = VideoFormat::new(DisplayMode::Ntsc, PixelFormat::Yuv8).rate();
    let mut last: Option<Timecode> = None;
    for _ in 0..3 {
        let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
        let tc = frame.buffer.metadata().unwrap().timecode;
        if let Some(prev) = last {
            assert!(tc.frame_index(&rate) > prev.frame_index(&rate));
        }
        last = Some(tc);
        frame.buffer.release();
    }
    assert_eq!(last, Some(ntsc_timecode(2)));

    device.close().unwrap();
}

#[test]
fn delayed_consumer_drops_exactly_one_frame() {
    // pool depth 4, five frames produced while the consumer sleeps
    let (mut device, card) = open_sim(Config::default());
    let script = card.script_link();
    device.configure(capture_request()).unwrap();
    let frames = device.frames().unwrap();
    let events = device.events();
    device.start().unwrap();

    for index in 0..5 {
        script.send(frame_event(index)).unwrap();
    }

    wait_for_event(&events, |e| {
        matches!(
            e,
            StreamEvent::FrameDropped {
                reason: DropReason::Backpressure,
                sequence: 0,
            }
        )
    });
    assert!(events.try_iter().all(|e| !matches!(
        e,
        DeviceEvent::Stream(StreamEvent::FrameDropped { .. })
    )));
    assert_eq!(device.engine_state(), EngineState::Running);

    // the oldest frame was reclaimed; 1..=4 are still delivered in order
    let delivered: Vec<u64> = (0..4)
        .map(|_| {
            let frame = frames.recv_timeout(RECV_TIMEOUT).unwrap();
            let seq = frame.buffer.metadata().unwrap().sequence;
            frame.buffer.release();
            seq
        })
        .collect();
    assert_eq!(delivered, vec![1, 2, 3, 4]);

    device.close().unwrap();
}

#[test]
fn signal_loss_stops_the_engine_without_restart() {
    let (mut device, card) = open_sim(Config::default());
    let script = card.script_link();
    device.configure(capture_request()).unwrap();
    let events = device.events();
    device.start().unwrap();

    script.send(frame_event(0)).unwrap();
    script.send(DriverEvent::SignalLost).unwrap();

    wait_for_event(&events, |e| matches!(e, StreamEvent::SignalLost));
    // the engine parks in Stopping; restarting is the caller's decision
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while device.engine_state() != EngineState::Stopping {
        assert!(std::time::Instant::now() < deadline, "engine never stopped");
        std::thread::sleep(Duration::from_millis(5));
    }
    device.stop().unwrap();
    assert_eq!(device.engine_state(), EngineState::Idle);
}

#[test]
fn playback_schedule_rejects_out_of_order_timecode() {
    let (mut device, card) = open_sim(Config::default());
    let _script = card.script_link();
    device
        .configure(StreamRequest {
            video: VideoFormat::new(DisplayMode::Ntsc, PixelFormat::Yuv8),
            audio: None,
            direction: LinkDirection::Playback,
        })
        .unwrap();
    device.start().unwrap();

    let schedule_at = |device: &Device, index: u64| -> deckstream::Result<()> {
        let mut buffer = device.acquire_buffer()?;
        buffer.attach(FrameMetadata {
            sequence: index,
            timecode: ntsc_timecode(index),
            stream_timestamp: Duration::ZERO,
            flags: FrameFlags::default(),
            hdr: None,
        });
        device.schedule(buffer)
    };

    schedule_at(&device, 5).unwrap();
    let err = schedule_at(&device, 3).unwrap_err();
    assert!(matches!(err, DeviceError::OutOfOrder { .. }));
    // the rejected buffer went back to the pool
    schedule_at(&device, 6).unwrap();

    device.close().unwrap();
}

#[test]
fn record_requires_running_capture() {
    let (mut device, card) = open_sim(Config::default());
    card.deck_script().set_locked(true);
    device.engage_deck_control().unwrap();
    device.pump_deck_status().unwrap();
    assert!(device.deck_status().unwrap().timecode_lock);

    // engine is idle: record must fail fast, deck state unchanged
    let err = device.send_deck_command(DeckCommand::Record).unwrap_err();
    assert!(matches!(err, DeviceError::InvalidSequence(_)));
    assert_eq!(
        device.deck_status().unwrap().transport,
        TransportState::Idle
    );

    // with a running capture stream the same command is accepted
    let _script = card.script_link();
    device.configure(capture_request()).unwrap();
    device.start().unwrap();
    device.send_deck_command(DeckCommand::Record).unwrap();
    assert_eq!(
        device.deck_status().unwrap().transport,
        TransportState::Recording
    );

    device.close().unwrap();
}

#[test]
fn deck_timeouts_disconnect_until_reengaged() {
    let (mut device, card) = open_sim(Config::default());
    device.engage_deck_control().unwrap();
    let events = device.events();

    card.deck_script().fail_next(3);
    let err = device.send_deck_command(DeckCommand::Play).unwrap_err();
    assert!(matches!(err, DeviceError::DeckUnresponsive { attempts: 3 }));
    assert!(events.try_iter().any(|e| matches!(
        e,
        DeviceEvent::Deck(deckstream::DeckEvent::Unresponsive { attempts: 3 })
    )));

    // "not connected" until a fresh engagement
    assert!(matches!(
        device.send_deck_command(DeckCommand::Play),
        Err(DeviceError::InvalidSequence(_))
    ));

    device.disengage_deck_control().unwrap();
    device.engage_deck_control().unwrap();
    device.send_deck_command(DeckCommand::Play).unwrap();
    assert_eq!(
        device.deck_status().unwrap().transport,
        TransportState::Playing
    );
}

#[test]
fn stop_is_idempotent() {
    let (mut device, card) = open_sim(Config::default());
    let script = card.script_link();
    device.configure(capture_request()).unwrap();

    // stop before start is a no-op
    device.stop().unwrap();
    assert_eq!(device.engine_state(), EngineState::Configured);

    device.start().unwrap();
    script.send(frame_event(0)).unwrap();
    device.stop().unwrap();
    assert_eq!(device.engine_state(), EngineState::Idle);
    device.stop().unwrap();
    assert_eq!(device.engine_state(), EngineState::Idle);

    // start twice without an intervening stop is rejected
    device.configure(capture_request()).unwrap();
    device.start().unwrap();
    assert!(matches!(
        device.start(),
        Err(DeviceError::InvalidSequence(_))
    ));
    device.close().unwrap();
}

#[test]
fn operations_after_close_fail() {
    let (mut device, _card) = open_sim(Config::default());
    device.configure(capture_request()).unwrap();
    device.close().unwrap();

    assert!(matches!(
        device.configure(capture_request()),
        Err(DeviceError::DeviceClosed)
    ));
    assert!(matches!(device.start(), Err(DeviceError::DeviceClosed)));
    assert!(matches!(device.frames(), Err(DeviceError::DeviceClosed)));
    assert!(matches!(
        device.engage_deck_control(),
        Err(DeviceError::DeviceClosed)
    ));
    assert!(matches!(device.close(), Err(DeviceError::DeviceClosed)));
}

#[test]
fn hdr_metadata_gated_by_capability() {
    // same card, but a profile that does not advertise HDR
    let browser = Browser::new();
    let card = Arc::new(SimCard::new());
    let mut profile = sim_profile();
    profile.capabilities.retain(|c| *c != Capability::HdrMetadata);
    let driver: Arc<SimCard> = Arc::clone(&card);
    browser.attach(sim_handle(), profile, driver);
    let mut device = Device::open(&browser, &sim_handle(), Config::default()).unwrap();

    let _script = card.script_link();
    device
        .configure(StreamRequest {
            video: VideoFormat::new(DisplayMode::Ntsc, PixelFormat::Yuv8),
            audio: None,
            direction: LinkDirection::Playback,
        })
        .unwrap();
    device.start().unwrap();

    let mut buffer = device.acquire_buffer().unwrap();
    buffer.attach(FrameMetadata {
        sequence: 0,
        timecode: ntsc_timecode(1),
        stream_timestamp: Duration::ZERO,
        flags: FrameFlags::default(),
        hdr: Some(deckstream::frame::HdrMetadata {
            eotf: deckstream::frame::Eotf::Pq,
            display_primaries: [[0.708, 0.292], [0.170, 0.797], [0.131, 0.046]],
            white_point: [0.3127, 0.3290],
            max_display_mastering_luminance: 1000.0,
            min_display_mastering_luminance: 0.0001,
            max_cll: 1000.0,
            max_fall: 400.0,
        }),
    });
    assert!(matches!(
        device.schedule(buffer),
        Err(DeviceError::UnsupportedFormat(_))
    ));
    device.close().unwrap();
}
