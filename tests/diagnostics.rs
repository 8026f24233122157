use std::time::Duration;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use cpch::handshake::{config_read_response, config_write_response};
use cpch::protocol::{
    encode_data_frame, CONFIG_WRITE_SUCCESS, PARAM_ACTIVE_CHANNELS, PARAM_DEVICE_ID,
};
use cpch::{Handshake, Headstage, HeadstageConfig, MemoryTransport};

/// Keeps every debug record emitted by this crate.
struct Capture {
    lines: Mutex<Vec<String>>,
}

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with("cpch")
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) && record.level() == Level::Debug {
            self.lines.lock().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture {
    lines: parking_lot::const_mutex(Vec::new()),
};

#[test]
fn defective_batch_logs_one_debug_line() {
    log::set_logger(&CAPTURE).unwrap();
    log::set_max_level(LevelFilter::Debug);

    let cfg = HeadstageConfig {
        num_samples: 8,
        ..HeadstageConfig::with_masks(0x0003, 0)
    };
    let handle = MemoryTransport::new();
    handle.queue_reply(Vec::new());
    handle.queue_reply(config_read_response(PARAM_DEVICE_ID, 1));
    handle.queue_reply(config_write_response(CONFIG_WRITE_SUCCESS));
    handle.queue_reply(config_read_response(
        PARAM_ACTIVE_CHANNELS,
        cfg.channel_map().channel_config(),
    ));
    let mut hs = Headstage::new(handle.clone(), cfg).with_handshake(Handshake {
        drain_delay: Duration::ZERO,
        max_drain_polls: 3,
    });
    hs.connect().unwrap();
    CAPTURE.lines.lock().clear();

    // One good frame between two with error status bits.
    let payload = [0u8; 4];
    let mut stream = encode_data_frame(0x10, 0, &payload);
    stream.extend(encode_data_frame(0, 1, &payload));
    stream.extend(encode_data_frame(0x20, 2, &payload));
    handle.push_inbound(&stream);
    hs.poll_once().unwrap();

    let lines = CAPTURE.lines.lock().clone();
    let defects: Vec<&String> = lines.iter().filter(|l| l.contains("defects")).collect();
    assert_eq!(defects.len(), 1, "{lines:?}");
    assert!(defects[0].contains("batch of 3 (1 accepted)"), "{}", defects[0]);
    assert_eq!(hs.error_totals().bad_status, 2);
}
