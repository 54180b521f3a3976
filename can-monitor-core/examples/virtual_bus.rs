//! Virtual bus demo
//!
//! Feeds synthetic engine frames through a `VirtualBus` and prints the decoded
//! values, without any CAN hardware.
//!
//! Usage:
//!   cargo run --example virtual_bus

use can_monitor_core::{
    load_dbc_str, CanMonitor, MessageDecoder, MonitorConfig, MonitorEvent, VirtualBus,
    VirtualDriver,
};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const DEMO_DBC: &str = r#"
BO_ 256 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (0.1,0) [0|6553.5] "rpm" Dash
 SG_ CoolantTemp : 16|8@1+ (1,-40) [-40|215] "degC" Dash

BO_ 1792 GearBox: 2 TCU
 SG_ Gear : 7|4@0+ (1,0) [0|8] "" Dash
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let database = load_dbc_str(DEMO_DBC, "demo.dbc")?;
    let engine = database.get(0x100).ok_or("EngineData missing")?.clone();

    let bus = VirtualBus::new().with_channel("vcan0");
    let (tx, rx) = mpsc::channel::<MonitorEvent>();
    let monitor = CanMonitor::new(
        Arc::new(VirtualDriver::new(bus.clone())),
        MonitorConfig::default(),
        tx,
    );
    monitor.set_database(database);
    monitor.select(0x100);
    monitor.connect("vcan0", 500_000)?;

    let producer = thread::spawn(move || {
        for step in 0..20u32 {
            let mut payload = [0u8; 8];
            let values = [800.0 + step as f64 * 150.0, 60.0 + step as f64];
            for (signal, value) in engine.signals.iter().zip(values) {
                MessageDecoder::encode_signal(&mut payload, signal, value);
            }
            bus.send("vcan0", 0x100, &payload);
            // Not selected, so it is decoded but never printed
            bus.send("vcan0", 0x700, &[0x30, 0x00]);
            thread::sleep(Duration::from_millis(20));
        }
    });

    let mut shown = 0;
    while shown < 20 {
        match rx.recv_timeout(Duration::from_secs(2))? {
            MonitorEvent::Message(message) => {
                let values: Vec<String> = message.signals.iter().map(|s| s.to_string()).collect();
                println!(
                    "{:>8.3}s  {}  {}",
                    message.timestamp_ns as f64 / 1e9,
                    message.message_name,
                    values.join(", ")
                );
                shown += 1;
            }
            other => println!("event: {:?}", other),
        }
    }

    producer.join().map_err(|_| "producer panicked")?;
    monitor.disconnect();
    println!("{:?}", monitor.stats());
    Ok(())
}
