//! Fixtures shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use p256::pkcs8::{EncodePrivateKey, LineEnding};
use p256::SecretKey;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde_json::json;

use crate::collaborators::{ConfigProbe, HardwareSource, Transport, TransportConfig};
use crate::protocol::Envelope;

pub const DEVICE_ID: &str = "device-id-123";
pub const REGISTER_CN: &str = "register";

/// Self-signed PEM certificate with the given subject CN.
pub fn mint_certificate(common_name: &str, key: &SecretKey) -> String {
    let pkcs8 = key.to_pkcs8_pem(LineEnding::LF).unwrap();
    let key_pair = KeyPair::from_pem(&pkcs8).unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut subject = DistinguishedName::new();
    subject.push(DnType::OrganizationName, "Flotta-operator");
    subject.push(DnType::CommonName, common_name);
    params.distinguished_name = subject;
    params.self_signed(&key_pair).unwrap().pem()
}

/// Bootstrap (or device) identity written to a temporary directory.
pub struct IdentityFixture {
    _dir: tempfile::TempDir,
    pub config: TransportConfig,
    pub cert_pem: String,
    pub key_pem: String,
}

impl IdentityFixture {
    pub fn new(common_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            cert_file: dir.path().join("reg.pem"),
            key_file: dir.path().join("reg.key"),
        };
        let key = SecretKey::random(&mut OsRng);
        let cert_pem = mint_certificate(common_name, &key);
        let key_pem = key.to_sec1_pem(LineEnding::LF).unwrap().to_string();
        fs::write(&config.cert_file, &cert_pem).unwrap();
        fs::write(&config.key_file, &key_pem).unwrap();

        Self {
            _dir: dir,
            config,
            cert_pem,
            key_pem,
        }
    }

    pub fn bootstrap() -> Self {
        Self::new(REGISTER_CN)
    }

    pub fn files(&self) -> (Vec<u8>, Vec<u8>) {
        (
            fs::read(&self.config.cert_file).unwrap(),
            fs::read(&self.config.key_file).unwrap(),
        )
    }
}

/// Outer envelope bytes carrying a registration message with `content`.
pub fn response(status_code: i64, content: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "StatusCode": status_code,
        "Body": {
            "Directive": "registration",
            "MessageID": "foo",
            "Content": content,
        },
        "Metadata": null,
    }))
    .unwrap()
}

pub fn certificate_response(certificate_pem: &str) -> Vec<u8> {
    response(200, json!({ "certificate": certificate_pem }))
}

/// Device certificate for [`DEVICE_ID`] signed by a throwaway key.
pub fn issued_certificate() -> String {
    mint_certificate(DEVICE_ID, &SecretKey::random(&mut OsRng))
}

pub enum Reply {
    Bytes(Vec<u8>),
    Fail(&'static str),
    Stall(Duration),
    /// Answer with the bytes after a delay
    Delayed(Duration, Vec<u8>),
}

/// Transport answering from a script and recording every envelope.
pub struct ScriptedTransport {
    config: TransportConfig,
    replies: Mutex<VecDeque<Reply>>,
    pub sent: Mutex<Vec<Envelope>>,
}

impl ScriptedTransport {
    pub fn new(config: TransportConfig, replies: Vec<Reply>) -> Self {
        Self {
            config,
            replies: Mutex::new(replies.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get_config(&self) -> anyhow::Result<TransportConfig> {
        Ok(self.config.clone())
    }

    async fn send(&self, envelope: Envelope) -> anyhow::Result<Vec<u8>> {
        self.sent.lock().unwrap().push(envelope);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Bytes(bytes)) => Ok(bytes),
            Some(Reply::Fail(reason)) => Err(anyhow::anyhow!(reason)),
            Some(Reply::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Err(anyhow::anyhow!("stalled"))
            }
            Some(Reply::Delayed(delay, bytes)) => {
                tokio::time::sleep(delay).await;
                Ok(bytes)
            }
            None => Err(anyhow::anyhow!("no scripted reply")),
        }
    }
}

pub struct StaticHardware;

impl HardwareSource for StaticHardware {
    fn hardware_information(&self) -> anyhow::Result<serde_json::Value> {
        Ok(json!({ "hostname": "edge-7", "cpu": { "architecture": "aarch64" } }))
    }
}

pub struct BrokenHardware;

impl HardwareSource for BrokenHardware {
    fn hardware_information(&self) -> anyhow::Result<serde_json::Value> {
        Err(anyhow::anyhow!("cannot read /proc/cpuinfo"))
    }
}

/// Probe whose answer can be flipped from the test.
pub struct SwitchProbe {
    initial: AtomicBool,
}

impl SwitchProbe {
    pub fn initial() -> Self {
        Self {
            initial: AtomicBool::new(true),
        }
    }

    pub fn configured() -> Self {
        Self {
            initial: AtomicBool::new(false),
        }
    }

    pub fn set_initial(&self, initial: bool) {
        self.initial.store(initial, Ordering::SeqCst);
    }
}

impl ConfigProbe for SwitchProbe {
    fn is_initial_config(&self) -> bool {
        self.initial.load(Ordering::SeqCst)
    }
}
