//! End-to-end TO2 scenarios against an in-process mock owner service.
//!
//! The mock implements the owner side of every message over the abstract
//! transport: it signs ProveOVHdr/SetupDevice with the voucher's tail key,
//! completes the key exchange, and plays back scripted service-info rounds.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use ciborium::value::Value;
use tokio_util::sync::CancellationToken;

use fdo_to2::cbor;
use fdo_to2::crypto::{cose, CipherSuite};
use fdo_to2::error::{Error, ModuleError, ProtocolError, TransportError, VoucherError};
use fdo_to2::kex::{DhSession, KexSuite, SessionKeys};
use fdo_to2::model::{Guid, Hash, HashAlg, Nonce, PublicKey, RendezvousInfo};
use fdo_to2::serviceinfo::{ServiceInfoKV, ServiceInfoModule, UnchunkWriter};
use fdo_to2::to2::messages as msg;
use fdo_to2::to2::{To2Client, To2Config};
use fdo_to2::transport::Transport;
use fdo_to2::voucher::DeviceCredential;
use fdo_to2::Signer;

use common::{build_voucher, tamper_entry_payload, VoucherFixture};

const REPLACEMENT_GUID: [u8; 16] = [0x77; 16];

/// One scripted OwnerServiceInfo response.
#[derive(Clone)]
struct OwnerRound {
    is_more: bool,
    is_done: bool,
    kvs: Vec<ServiceInfoKV>,
}

#[derive(Default)]
struct Behavior {
    /// Echo a wrong nonce in ProveOVHdr.
    tamper_hello_echo: bool,
    /// Answer Done with message type 63 instead of Done2.
    done2_wrong_type: bool,
    /// Advertised maximum message size (0 = unenforced).
    max_owner_message_size: u16,
    /// Respond to this request type with the reserved Error(255) message.
    error_on: Option<u8>,
    /// Responses for successive DeviceServiceInfo messages; once exhausted
    /// the owner reports done.
    owner_rounds: Vec<OwnerRound>,
}

#[derive(Default)]
struct OwnerState {
    msg_log: Vec<u8>,
    prove_device_nonce: Option<Nonce>,
    setup_device_nonce: Option<Nonce>,
    kex: Option<DhSession>,
    owner_keys: Option<SessionKeys>,
    device_keys: Option<SessionKeys>,
    rounds: VecDeque<OwnerRound>,
    received_device_info: Vec<ServiceInfoKV>,
    device_info_messages: usize,
    device_info_more_flags: Vec<bool>,
}

struct Inner {
    fixture: VoucherFixture,
    behavior: Behavior,
    state: Mutex<OwnerState>,
}

#[derive(Clone)]
struct MockOwner {
    inner: Arc<Inner>,
}

impl MockOwner {
    fn new(fixture: VoucherFixture, behavior: Behavior) -> Self {
        let state = OwnerState {
            rounds: behavior.owner_rounds.iter().cloned().collect(),
            ..OwnerState::default()
        };
        Self {
            inner: Arc::new(Inner {
                fixture,
                behavior,
                state: Mutex::new(state),
            }),
        }
    }

    fn cred(&self) -> DeviceCredential {
        self.inner.fixture.cred.clone()
    }

    fn owner_public_key(&self) -> PublicKey {
        self.inner.fixture.owner_signer.public_key().unwrap()
    }

    fn state(&self) -> MutexGuard<'_, OwnerState> {
        self.inner.state.lock().unwrap()
    }

    fn handle(&self, msg_type: u8, body: Value) -> (u8, Vec<u8>) {
        let inner = &self.inner;
        let mut st = self.state();
        st.msg_log.push(msg_type);

        if inner.behavior.error_on == Some(msg_type) {
            let err = fdo_to2::model::ErrorMessage {
                code: 100,
                prev_msg_type: msg_type,
                message: "message body structurally unsound".into(),
                timestamp: Some(1_700_000_000),
                correlation_id: None,
            };
            return (fdo_to2::transport::ERROR_MSG_TYPE, cbor::to_vec(&err.to_value()).unwrap());
        }

        match msg_type {
            msg::HELLO_DEVICE => {
                let items = match body {
                    Value::Array(items) => items,
                    _ => panic!("HelloDevice body is not an array"),
                };
                assert_eq!(items.len(), 6);
                let hello_nonce = Nonce::from_value(items[2].clone()).unwrap();
                let kex_suite = match &items[3] {
                    Value::Text(name) => KexSuite::from_name(name).unwrap(),
                    other => panic!("kex suite is not text: {other:?}"),
                };
                let cipher = CipherSuite::from_i64(cbor::int(&items[4], "cipher").unwrap()).unwrap();

                let mut kex = DhSession::new(kex_suite, cipher, None).unwrap();
                let xa = kex.generate_parameter(&mut rand::thread_rng()).unwrap();
                st.kex = Some(kex);

                let prove_device_nonce = Nonce::generate();
                st.prove_device_nonce = Some(prove_device_nonce);
                let echo = if inner.behavior.tamper_hello_echo {
                    Nonce::generate()
                } else {
                    hello_nonce
                };

                let payload = Value::Array(vec![
                    Value::Bytes(inner.fixture.header_raw.clone()),
                    Value::Integer((inner.fixture.entries_raw.len() as u64).into()),
                    inner.fixture.header_hmac.to_value(),
                    echo.to_value(),
                    items[5].clone(),
                    Value::Bytes(xa),
                    Hash::of(HashAlg::Sha256, b"hello-device").to_value(),
                    Value::Integer(inner.behavior.max_owner_message_size.into()),
                ]);
                let signed = cose::sign1(
                    inner.fixture.owner_signer.as_ref(),
                    vec![
                        (msg::CUPH_NONCE_CLAIM, prove_device_nonce.to_value()),
                        (msg::CUPH_OWNER_PUBKEY_CLAIM, self.owner_public_key().to_value()),
                    ],
                    cbor::to_vec(&payload).unwrap(),
                )
                .unwrap();
                (msg::PROVE_OV_HDR, signed)
            }

            msg::GET_OV_NEXT_ENTRY => {
                let items = cbor::array(body, "GetOVNextEntry").unwrap();
                let i = cbor::uint(&items[0], "entry num").unwrap() as usize;
                let entry = cbor::from_slice(&inner.fixture.entries_raw[i]).unwrap();
                let resp = Value::Array(vec![Value::Integer((i as u64).into()), entry]);
                (msg::OV_NEXT_ENTRY, cbor::to_vec(&resp).unwrap())
            }

            msg::PROVE_DEVICE => {
                let raw = cbor::to_vec(&body).unwrap();
                let signed = cose::decode(&raw, "ProveDevice").unwrap();

                let device_pub = inner.fixture.cred.key.public_key().unwrap();
                cose::verify(&signed, &device_pub.public().unwrap(), false).unwrap();

                let setup_nonce = cose::unprotected_claim(&signed, msg::EUPH_NONCE_CLAIM)
                    .cloned()
                    .map(|v| Nonce::from_value(v).unwrap())
                    .expect("EAT nonce header missing");
                st.setup_device_nonce = Some(setup_nonce);

                let eat = cbor::from_slice(signed.payload.as_ref().unwrap()).unwrap();
                let entries = match eat {
                    Value::Map(m) => m,
                    _ => panic!("EAT payload is not a map"),
                };
                let claim = |label: i64| {
                    entries
                        .iter()
                        .find(|(k, _)| {
                            matches!(k, Value::Integer(i) if i128::from(*i) == i128::from(label))
                        })
                        .map(|(_, v)| v.clone())
                        .unwrap()
                };
                assert_eq!(
                    Nonce::from_value(claim(10)).unwrap(),
                    st.prove_device_nonce.unwrap(),
                    "EAT must carry the ProveOVHdr nonce"
                );
                let xb = match claim(-257) {
                    Value::Array(items) => match &items[0] {
                        Value::Bytes(b) => b.clone(),
                        other => panic!("key exchange B is not bytes: {other:?}"),
                    },
                    other => panic!("EAT-FDO claim is not an array: {other:?}"),
                };

                let derived = {
                    let kex = st.kex.as_mut().unwrap();
                    kex.set_peer_parameter(&xb).unwrap();
                    kex.keys().cloned()
                };
                st.owner_keys = derived;

                let payload = Value::Array(vec![
                    RendezvousInfo::empty().to_value(),
                    Guid(REPLACEMENT_GUID).to_value(),
                    setup_nonce.to_value(),
                    self.owner_public_key().to_value(),
                ]);
                let signed = cose::sign1(
                    inner.fixture.owner_signer.as_ref(),
                    Vec::new(),
                    cbor::to_vec(&payload).unwrap(),
                )
                .unwrap();
                (msg::SETUP_DEVICE, signed)
            }

            msg::DEVICE_SERVICE_INFO_READY => {
                let resp = Value::Array(vec![Value::Null]);
                (msg::OWNER_SERVICE_INFO_READY, cbor::to_vec(&resp).unwrap())
            }

            msg::DEVICE_SERVICE_INFO => {
                let items = cbor::array(body, "DeviceServiceInfo").unwrap();
                st.device_info_messages += 1;
                st.device_info_more_flags
                    .push(cbor::boolean(&items[0], "is more").unwrap());
                if let Value::Array(kvs) = &items[1] {
                    for kv in kvs {
                        st.received_device_info
                            .push(ServiceInfoKV::from_value(kv.clone()).unwrap());
                    }
                }

                let round = st.rounds.pop_front().unwrap_or(OwnerRound {
                    is_more: false,
                    is_done: true,
                    kvs: Vec::new(),
                });
                let resp = Value::Array(vec![
                    Value::Bool(round.is_more),
                    Value::Bool(round.is_done),
                    Value::Array(round.kvs.iter().map(ServiceInfoKV::to_value).collect()),
                ]);
                (msg::OWNER_SERVICE_INFO, cbor::to_vec(&resp).unwrap())
            }

            msg::DONE => {
                let mut items = cbor::array(body, "Done").unwrap();
                let nonce = Nonce::from_value(items.remove(0)).unwrap();
                assert_eq!(nonce, st.prove_device_nonce.unwrap());

                let resp = Value::Array(vec![st.setup_device_nonce.unwrap().to_value()]);
                let resp_type = if inner.behavior.done2_wrong_type {
                    msg::OV_NEXT_ENTRY
                } else {
                    msg::DONE2
                };
                (resp_type, cbor::to_vec(&resp).unwrap())
            }

            other => panic!("mock owner received unexpected message type {other}"),
        }
    }
}

#[async_trait]
impl Transport for MockOwner {
    async fn send(
        &self,
        _base_url: &str,
        msg_type: u8,
        body: Value,
    ) -> Result<(u8, Bytes), TransportError> {
        let (resp_type, resp) = self.handle(msg_type, body);
        Ok((resp_type, Bytes::from(resp)))
    }

    async fn begin_encryption(
        &self,
        _cipher: CipherSuite,
        keys: &SessionKeys,
    ) -> Result<(), TransportError> {
        self.state().device_keys = Some(keys.clone());
        Ok(())
    }
}

struct Echo;

#[async_trait]
impl ServiceInfoModule for Echo {
    async fn handle(
        &self,
        message: &str,
        value: &[u8],
        respond: &mut UnchunkWriter,
    ) -> Result<(), ModuleError> {
        match message {
            "ping" => {
                respond.begin("echo", "pong")?;
                respond.write(value)?;
                Ok(())
            }
            other => Err(ModuleError::new("echo", format!("unknown message {other}"))),
        }
    }
}

fn quick_config() -> To2Config {
    To2Config {
        service_info_poll_delay: Duration::from_millis(50),
        ..To2Config::default()
    }
}

#[tokio::test]
async fn single_entry_voucher_no_service_info() {
    let mock = MockOwner::new(build_voucher(1), Behavior::default());
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    let replacement = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap();

    // Replacement header: guid/rendezvous/owner key substituted, the rest
    // copied from the original.
    assert_eq!(replacement.guid, Guid(REPLACEMENT_GUID));
    assert_eq!(replacement.version, 101);
    assert_eq!(replacement.device_info, "rust-test-device");
    assert!(replacement.manufacturer_key.equals(&mock.owner_public_key()));

    let st = mock.state();
    assert_eq!(
        st.msg_log,
        vec![
            msg::HELLO_DEVICE,
            msg::GET_OV_NEXT_ENTRY,
            msg::PROVE_DEVICE,
            msg::DEVICE_SERVICE_INFO_READY,
            msg::DEVICE_SERVICE_INFO,
            msg::DONE,
        ]
    );
}

#[tokio::test]
async fn key_exchange_derives_identical_session_keys() {
    let mock = MockOwner::new(build_voucher(1), Behavior::default());
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap();

    let st = mock.state();
    let device = st.device_keys.as_ref().expect("device keys installed");
    let owner = st.owner_keys.as_ref().expect("owner keys derived");
    assert_eq!(device, owner);
    // Strongest configured suite: A256GCM has a 32-byte SEK and no SVK.
    assert_eq!(device.sek.len(), 32);
    assert!(device.svk.is_empty());
}

#[tokio::test]
async fn three_entry_voucher_with_module_echo() {
    let ping = cbor::to_vec(&Value::Integer(0x42.into())).unwrap();
    let behavior = Behavior {
        owner_rounds: vec![
            OwnerRound {
                is_more: false,
                is_done: false,
                kvs: vec![ServiceInfoKV::new("echo", "ping", ping.clone())],
            },
            OwnerRound {
                is_more: false,
                is_done: true,
                kvs: Vec::new(),
            },
        ],
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(3), behavior);
    let client = To2Client::new(mock.clone(), mock.cred())
        .with_config(quick_config())
        .register_module("echo", Arc::new(Echo));

    client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap();

    let st = mock.state();
    let pong = st
        .received_device_info
        .iter()
        .find(|kv| kv.key == "echo:pong")
        .expect("module reply reached the owner");
    assert_eq!(pong.value, ping);
}

#[tokio::test]
async fn mismatched_prove_ov_hdr_nonce_aborts_immediately() {
    let behavior = Behavior {
        tamper_hello_echo: true,
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    let err = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::NonceMismatch { .. })
    ));

    // No further messages after the bad response.
    assert_eq!(mock.state().msg_log, vec![msg::HELLO_DEVICE]);
}

#[tokio::test]
async fn tampered_second_entry_detected_after_fetch() {
    let mut fixture = build_voucher(3);
    fixture.entries_raw[1] = tamper_entry_payload(&fixture.entries_raw[1]);

    let mock = MockOwner::new(fixture, Behavior::default());
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    let err = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Voucher(VoucherError::BadSignature { index: 1 })
    ));

    // All entries are fetched before verification; ProveDevice never sent.
    let st = mock.state();
    assert_eq!(
        st.msg_log,
        vec![
            msg::HELLO_DEVICE,
            msg::GET_OV_NEXT_ENTRY,
            msg::GET_OV_NEXT_ENTRY,
            msg::GET_OV_NEXT_ENTRY,
        ]
    );
}

#[tokio::test]
async fn owner_output_across_multiple_rounds() {
    let blob = |b: u8| ServiceInfoKV::new("data", "blob", vec![b; 40]);
    let behavior = Behavior {
        owner_rounds: vec![
            OwnerRound {
                is_more: true,
                is_done: false,
                kvs: vec![blob(1), blob(2)],
            },
            OwnerRound {
                is_more: false,
                is_done: true,
                kvs: vec![blob(3)],
            },
        ],
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap();

    // Both rounds executed before is_done was honored.
    assert_eq!(mock.state().device_info_messages, 2);
}

#[tokio::test]
async fn cancellation_during_poll_delay_returns_promptly() {
    // One not-done round with nothing to exchange forces the idle delay.
    let behavior = Behavior {
        owner_rounds: vec![OwnerRound {
            is_more: false,
            is_done: false,
            kvs: Vec::new(),
        }],
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    // Default 5 s poll delay: cancellation must cut it short.
    let client = To2Client::new(mock.clone(), mock.cred());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = client.onboard("http://owner.test", cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "cancellation should interrupt the poll delay"
    );
}

#[tokio::test]
async fn idle_poll_waits_before_asking_again() {
    let behavior = Behavior {
        owner_rounds: vec![
            OwnerRound {
                is_more: false,
                is_done: false,
                kvs: Vec::new(),
            },
            OwnerRound {
                is_more: false,
                is_done: true,
                kvs: Vec::new(),
            },
        ],
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    let delay = Duration::from_millis(300);
    let config = To2Config {
        service_info_poll_delay: delay,
        ..To2Config::default()
    };
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(config);

    let started = Instant::now();
    client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap();
    assert!(
        started.elapsed() >= delay,
        "second poll must wait out the idle delay"
    );
    assert_eq!(mock.state().device_info_messages, 2);
}

/// The response to Done must be Done2 (type 71); type 63 here is a known
/// owner-side bug and is treated as a protocol error.
#[tokio::test]
async fn done_answered_with_wrong_type_rejected() {
    let behavior = Behavior {
        done2_wrong_type: true,
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    let err = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::UnexpectedMessageType {
            request: "Done",
            received: 63,
        })
    ));
}

#[tokio::test]
async fn oversized_request_rejected_before_sending() {
    let behavior = Behavior {
        max_owner_message_size: 1000,
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    let client = To2Client::new(mock.clone(), mock.cred())
        .with_config(quick_config())
        .with_initial_service_info(vec![ServiceInfoKV::new(
            "fdo.upload",
            "data",
            vec![0xAA; 1200],
        )]);

    let err = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::MessageTooLarge { .. })
    ));
    // The offending DeviceServiceInfo was never delivered.
    assert_eq!(mock.state().device_info_messages, 0);
}

#[tokio::test]
async fn zero_entry_voucher_rejected_before_fetching() {
    let mock = MockOwner::new(build_voucher(0), Behavior::default());
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    let err = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::EmptyVoucher)
    ));
    // No entry was ever requested.
    assert_eq!(mock.state().msg_log, vec![msg::HELLO_DEVICE]);
}

#[tokio::test]
async fn device_output_spans_multiple_messages() {
    let kv_a = ServiceInfoKV::new("fdo.upload", "data", vec![0x11; 800]);
    let kv_b = ServiceInfoKV::new("fdo.upload", "data", vec![0x22; 800]);
    let mock = MockOwner::new(build_voucher(1), Behavior::default());
    let client = To2Client::new(mock.clone(), mock.cred())
        .with_config(quick_config())
        .with_initial_service_info(vec![kv_a.clone(), kv_b.clone()]);

    client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap();

    let st = mock.state();
    // Two KVs of ~800 bytes cannot share one 1300-byte message: the first
    // goes out flagged is_more, the second follows in a fresh message.
    assert_eq!(st.device_info_messages, 2);
    assert_eq!(st.device_info_more_flags, vec![true, false]);
    assert_eq!(st.received_device_info, vec![kv_a, kv_b]);
}

#[tokio::test]
async fn owner_error_message_surfaces_as_remote_error() {
    let behavior = Behavior {
        error_on: Some(msg::PROVE_DEVICE),
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    let client = To2Client::new(mock.clone(), mock.cred()).with_config(quick_config());

    let err = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        Error::Remote(remote) => {
            assert_eq!(remote.code, 100);
            assert_eq!(remote.prev_msg_type, msg::PROVE_DEVICE);
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_module_aborts_with_module_error() {
    let bad = cbor::to_vec(&Value::Text("nope".into())).unwrap();
    let behavior = Behavior {
        owner_rounds: vec![OwnerRound {
            is_more: false,
            is_done: false,
            kvs: vec![ServiceInfoKV::new("echo", "unsupported", bad)],
        }],
        ..Behavior::default()
    };
    let mock = MockOwner::new(build_voucher(1), behavior);
    let client = To2Client::new(mock.clone(), mock.cred())
        .with_config(quick_config())
        .register_module("echo", Arc::new(Echo));

    let err = client
        .onboard("http://owner.test", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Module(ModuleError { .. })));
}
