//! Catalog bundled into the binary
//!
//! The bundled asset ships inside the signed application, so it is trusted
//! without a detached signature. It still goes through schema validation.

use super::record::{BrokerRecord, Platform};

/// `assets/brokers.json`, compiled in
pub static EMBEDDED_CATALOG: &[u8] = include_bytes!("../../assets/brokers.json");

/// Last-resort record used when even the bundled asset is unusable
pub fn emergency_record() -> BrokerRecord {
    BrokerRecord {
        name: "Brokercat Demo".to_string(),
        server: "Brokercat-Demo".to_string(),
        platform: Platform::Mt5,
        web_terminal_url: "https://web.metatrader.app/terminal".to_string(),
        logo: None,
        description: Some("Offline fallback demo server".to_string()),
        demo: true,
    }
}
