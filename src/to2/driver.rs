//! The TO2 protocol driver: a straight-line sequence of request/response
//! transitions, each serializing a CBOR body, dispatching it through the
//! transport, and verifying the reply before updating session state.

use std::sync::Arc;

use bytes::Bytes;
use ciborium::value::Value;
use tokio_util::sync::CancellationToken;

use super::dispatch::{self, ModuleMap};
use super::messages as msg;
use super::{To2Config, To2Context};
use crate::cbor;
use crate::crypto::{cose, CipherSuite, SigInfo};
use crate::error::{Error, PipeError, ProtocolError, Result, VoucherError};
use crate::kex::{DhSession, KexSuite};
use crate::model::{ErrorMessage, HashAlg, Nonce};
use crate::serviceinfo::pipe::{self, ChunkRead, ChunkReader, ChunkWriter};
use crate::serviceinfo::{ServiceInfoKV, ServiceInfoModule, DEFAULT_MTU};
use crate::transport::{Transport, ERROR_MSG_TYPE};
use crate::voucher::{DeviceCredential, Voucher, VoucherEntry, VoucherHeader};

/// TO2 client: drives one onboarding attempt against an owner service.
pub struct To2Client<T: Transport> {
    transport: T,
    cred: DeviceCredential,
    modules: ModuleMap,
    initial_service_info: Vec<ServiceInfoKV>,
    config: To2Config,
}

impl<T: Transport> To2Client<T> {
    pub fn new(transport: T, cred: DeviceCredential) -> Self {
        Self {
            transport,
            cred,
            modules: ModuleMap::new(),
            initial_service_info: Vec::new(),
            config: To2Config::default(),
        }
    }

    pub fn with_config(mut self, config: To2Config) -> Self {
        self.config = config;
        self
    }

    /// Register a service-info module under its FDO module name.
    pub fn register_module(mut self, name: &str, module: Arc<dyn ServiceInfoModule>) -> Self {
        self.modules.insert(name.to_string(), module);
        self
    }

    /// Service info the device volunteers in the first loop round (e.g. the
    /// devmod key-values).
    pub fn with_initial_service_info(mut self, kvs: Vec<ServiceInfoKV>) -> Self {
        self.initial_service_info = kvs;
        self
    }

    /// Run the full TO2 protocol. On success, returns the replacement
    /// voucher header to be stored by the credential updater.
    ///
    /// The cancellation token is honored at every transport exchange, pipe
    /// transfer, and poll delay; the dispatcher task is always joined before
    /// returning.
    pub async fn onboard(
        &self,
        base_url: &str,
        cancel: CancellationToken,
    ) -> Result<VoucherHeader> {
        tracing::info!(guid = %hex::encode(self.cred.guid.as_bytes()), "starting TO2 onboarding");

        let mut ctx = self.verify_owner(base_url, &cancel).await?;
        let replacement = self.prove_device(base_url, &mut ctx, &cancel).await?;
        let mtu = self.ready_service_info(base_url, &ctx, &replacement, &cancel).await?;
        self.exchange_service_info(base_url, &ctx, mtu, &cancel).await?;
        self.done(base_url, &ctx, &cancel).await?;

        tracing::info!("TO2 onboarding complete");
        Ok(replacement)
    }

    /// One request/response exchange. Any response may be the reserved
    /// Error(255) message; other unexpected types are fatal.
    async fn exchange(
        &self,
        base_url: &str,
        request: &'static str,
        msg_type: u8,
        body: Value,
        expect: u8,
        max_owner_size: u16,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if max_owner_size != 0 {
            let size = cbor::to_vec(&body)?.len();
            if size > max_owner_size as usize {
                return Err(ProtocolError::MessageTooLarge {
                    size,
                    max: max_owner_size as usize,
                }
                .into());
            }
        }

        tracing::debug!(request, msg_type, "sending TO2 message");
        let (resp_type, resp) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.transport.send(base_url, msg_type, body) => result?,
        };

        if resp_type == expect {
            return Ok(resp);
        }
        if resp_type == ERROR_MSG_TYPE {
            let err = ErrorMessage::from_value(cbor::from_slice(&resp)?)?;
            tracing::warn!(request, code = err.code, "owner service returned an error");
            return Err(Error::Remote(err));
        }
        Err(ProtocolError::UnexpectedMessageType {
            request,
            received: resp_type,
        }
        .into())
    }

    /// HelloDevice(60) -> ProveOVHdr(61), GetOVNextEntry(62) ->
    /// OVNextEntry(63) (repeated), then full voucher verification.
    async fn verify_owner(&self, base_url: &str, cancel: &CancellationToken) -> Result<To2Context> {
        let ctx = self.hello_device(base_url, cancel).await?;

        if ctx.num_voucher_entries == 0 {
            return Err(ProtocolError::EmptyVoucher.into());
        }
        let mut entries = Vec::with_capacity(ctx.num_voucher_entries);
        for i in 0..ctx.num_voucher_entries {
            entries.push(self.next_ov_entry(base_url, &ctx, i, cancel).await?);
        }

        let voucher = Voucher {
            header: ctx.header.clone(),
            header_raw: ctx.header_raw.clone(),
            header_hmac: ctx.header_hmac.clone(),
            entries,
        };

        voucher.verify_header(self.cred.hmac.as_ref())?;
        voucher.verify_manufacturer_key(&self.cred.public_key_hash)?;
        voucher.verify_entries()?;

        // The ProveOVHdr signature was checked against the key the owner
        // itself claimed; only this equality makes that signature
        // trustworthy.
        let tail = voucher
            .tail_public_key()
            .ok_or(ProtocolError::EmptyVoucher)?;
        if !ctx.owner_public_key.equals(tail) {
            return Err(VoucherError::OwnerKeyMismatch.into());
        }

        tracing::info!(
            entries = ctx.num_voucher_entries,
            "ownership voucher verified"
        );
        Ok(ctx)
    }

    async fn hello_device(&self, base_url: &str, cancel: &CancellationToken) -> Result<To2Context> {
        let hello_nonce = Nonce::generate();

        let kex_suite = KexSuite::strongest(&self.config.kex_suites).ok_or_else(|| {
            ProtocolError::Malformed {
                context: "configuration",
                reason: "no key exchange suite configured".into(),
            }
        })?;
        let cipher_suite = CipherSuite::strongest(&self.config.cipher_suites).ok_or_else(|| {
            ProtocolError::Malformed {
                context: "configuration",
                reason: "no cipher suite configured".into(),
            }
        })?;
        let sig_info_a = SigInfo::new(self.cred.key.alg());

        let body = msg::hello_device(
            self.config.max_device_message_size,
            &self.cred.guid,
            &hello_nonce,
            kex_suite.name(),
            cipher_suite.id(),
            &sig_info_a,
        );
        let resp = self
            .exchange(base_url, "HelloDevice", msg::HELLO_DEVICE, body, msg::PROVE_OV_HDR, 0, cancel)
            .await?;

        let signed = cose::decode(&resp, "ProveOVHdr")?;

        let prove_device_nonce = cose::unprotected_claim(&signed, msg::CUPH_NONCE_CLAIM)
            .cloned()
            .ok_or(ProtocolError::MissingField("ProveOVHdr nonce header"))
            .and_then(Nonce::from_value)?;
        let owner_public_key = cose::unprotected_claim(&signed, msg::CUPH_OWNER_PUBKEY_CLAIM)
            .cloned()
            .ok_or(ProtocolError::MissingField("ProveOVHdr owner public key header"))
            .and_then(crate::model::PublicKey::from_value)?;

        // The signature is checked against the owner's own claim; trust is
        // deferred until the voucher tail comparison in verify_owner.
        let owner_key = owner_public_key.public()?;
        cose::verify(&signed, &owner_key, owner_public_key.key_type.uses_pss())?;

        let payload = msg::decode_prove_ov_hdr(&signed)?;
        if payload.hello_nonce_echo != hello_nonce {
            return Err(ProtocolError::NonceMismatch {
                request: "HelloDevice",
                response: "ProveOVHdr",
            }
            .into());
        }

        Ok(To2Context {
            prove_device_nonce,
            setup_device_nonce: None,
            owner_public_key,
            header: payload.header,
            header_raw: payload.header_raw,
            header_hmac: payload.header_hmac,
            num_voucher_entries: payload.num_entries,
            sig_info_b: payload.sig_info_b,
            kex_suite,
            cipher_suite,
            key_exchange_a: payload.key_exchange_a,
            max_device_message_size: self.config.max_device_message_size,
            max_owner_message_size: payload.max_owner_message_size,
        })
    }

    async fn next_ov_entry(
        &self,
        base_url: &str,
        ctx: &To2Context,
        entry_num: usize,
        cancel: &CancellationToken,
    ) -> Result<VoucherEntry> {
        let resp = self
            .exchange(
                base_url,
                "GetOVNextEntry",
                msg::GET_OV_NEXT_ENTRY,
                msg::get_ov_next_entry(entry_num),
                msg::OV_NEXT_ENTRY,
                ctx.max_owner_message_size,
                cancel,
            )
            .await?;

        let (echoed, entry_raw) = msg::decode_ov_next_entry(cbor::from_slice(&resp)?)?;
        if echoed != entry_num {
            return Err(ProtocolError::EntryNumMismatch {
                requested: entry_num,
                received: echoed,
            }
            .into());
        }
        Ok(VoucherEntry::from_tagged_slice(entry_raw, entry_num)?)
    }

    /// ProveDevice(64) -> SetupDevice(65): sign an EAT carrying the device
    /// key exchange parameter, then build the replacement voucher header
    /// from the owner's response.
    async fn prove_device(
        &self,
        base_url: &str,
        ctx: &mut To2Context,
        cancel: &CancellationToken,
    ) -> Result<VoucherHeader> {
        let setup_device_nonce = Nonce::generate();
        ctx.setup_device_nonce = Some(setup_device_nonce);

        let mut session = DhSession::new(ctx.kex_suite, ctx.cipher_suite, Some(&ctx.key_exchange_a))?;
        let key_exchange_b = session.generate_parameter(&mut rand::thread_rng())?;

        let eat = msg::eat_payload(&self.cred.guid, &ctx.prove_device_nonce, &key_exchange_b)?;
        let token = cose::sign1(
            self.cred.key.as_ref(),
            vec![(msg::EUPH_NONCE_CLAIM, setup_device_nonce.to_value())],
            eat,
        )?;

        // Session keys exist as soon as our exchange parameter does; the
        // transport encrypts everything from the SetupDevice response on.
        let keys = session
            .keys()
            .ok_or_else(|| crate::error::CryptoError::KdfFailed("key exchange incomplete".into()))?;
        self.transport.begin_encryption(ctx.cipher_suite, keys).await?;
        tracing::info!(
            kex_suite = ctx.kex_suite.name(),
            cipher = ctx.cipher_suite.id(),
            "session keys established"
        );

        let resp = self
            .exchange(
                base_url,
                "ProveDevice",
                msg::PROVE_DEVICE,
                cbor::from_slice(&token)?,
                msg::SETUP_DEVICE,
                ctx.max_owner_message_size,
                cancel,
            )
            .await?;

        let signed = cose::decode(&resp, "SetupDevice")?;
        let owner_key = ctx.owner_public_key.public()?;
        cose::verify(&signed, &owner_key, ctx.owner_public_key.key_type.uses_pss())?;

        let payload = msg::decode_setup_device(&signed)?;
        if payload.setup_device_nonce_echo != setup_device_nonce {
            return Err(ProtocolError::NonceMismatch {
                request: "ProveDevice",
                response: "SetupDevice",
            }
            .into());
        }

        Ok(VoucherHeader {
            version: ctx.header.version,
            guid: payload.guid,
            rv_info: payload.rv_info,
            device_info: ctx.header.device_info.clone(),
            manufacturer_key: payload.owner2_key,
            cert_chain_hash: ctx.header.cert_chain_hash.clone(),
        })
    }

    /// DeviceServiceInfoReady(66) -> OwnerServiceInfoReady(67). Returns the
    /// MTU for device-to-owner service info.
    async fn ready_service_info(
        &self,
        base_url: &str,
        ctx: &To2Context,
        replacement: &VoucherHeader,
        cancel: &CancellationToken,
    ) -> Result<u16> {
        let header_bytes = replacement.to_vec()?;
        let hmac_alg = if self.cred.hmac.supports(HashAlg::HmacSha384) {
            HashAlg::HmacSha384
        } else {
            HashAlg::HmacSha256
        };
        let replacement_hmac = self.cred.hmac.hmac(hmac_alg, &header_bytes)?;

        let mut max_receive = self.config.max_service_info_size_receive;
        if max_receive == 0 {
            max_receive = DEFAULT_MTU;
        }

        let resp = self
            .exchange(
                base_url,
                "DeviceServiceInfoReady",
                msg::DEVICE_SERVICE_INFO_READY,
                msg::device_service_info_ready(&replacement_hmac, max_receive),
                msg::OWNER_SERVICE_INFO_READY,
                ctx.max_owner_message_size,
                cancel,
            )
            .await?;

        let mtu = msg::decode_owner_service_info_ready(cbor::from_slice(&resp)?)?
            .filter(|&m| m != 0)
            .unwrap_or(DEFAULT_MTU);
        tracing::debug!(mtu, "service info ready");
        Ok(mtu)
    }

    /// The DeviceServiceInfo(68) <-> OwnerServiceInfo(69) loop. Each outer
    /// iteration pairs fresh pipes with one dispatcher task; module output
    /// produced while feeding this round's owner info becomes the next
    /// round's device info.
    async fn exchange_service_info(
        &self,
        base_url: &str,
        ctx: &To2Context,
        mtu: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut device_out = pipe::preloaded(self.initial_service_info.clone());
        // No owner response yet, so the first round never idles.
        let mut prev_owner_more = true;

        loop {
            let (mut owner_tx, owner_rx) = pipe::in_pipe();
            let (device_writer, next_device_out) = pipe::out_pipe(mtu as usize);
            let task = tokio::spawn(dispatch::run(
                self.modules.clone(),
                owner_rx,
                device_writer,
                cancel.clone(),
            ));

            let round = self
                .service_info_rounds(
                    base_url,
                    ctx,
                    mtu,
                    &mut device_out,
                    &mut owner_tx,
                    &mut prev_owner_more,
                    cancel,
                )
                .await;

            if round.is_err() {
                owner_tx.close_with_error(match &round {
                    Err(Error::Cancelled) => PipeError::Cancelled,
                    Err(e) => PipeError::Poisoned(e.to_string()),
                    Ok(_) => unreachable!(),
                });
            }

            let dispatcher = match task.await {
                Ok(result) => result,
                Err(join) => Err(crate::error::ModuleError::new("dispatcher", join.to_string())),
            };

            match (round, dispatcher) {
                (Err(e @ Error::Cancelled), _) => return Err(e),
                (_, Err(module_err)) => return Err(module_err.into()),
                (Err(e), _) => return Err(e),
                (Ok(true), Ok(())) => return Ok(()),
                (Ok(false), Ok(())) => device_out = next_device_out,
            }
        }
    }

    /// Run protocol messages until neither side has more service info.
    /// Returns the owner's `is_done` flag.
    #[allow(clippy::too_many_arguments)]
    async fn service_info_rounds(
        &self,
        base_url: &str,
        ctx: &To2Context,
        mtu: u16,
        device_out: &mut ChunkReader,
        owner_tx: &mut ChunkWriter,
        prev_owner_more: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        loop {
            // Pack chunks up to the MTU budget.
            let mut service_info = Vec::new();
            let mut is_more = false;
            let mut remaining = mtu as usize;
            loop {
                match device_out.read_chunk(remaining).await {
                    Ok(ChunkRead::Chunk(kv)) => {
                        remaining -= kv.serialized_size();
                        service_info.push(kv);
                    }
                    Ok(ChunkRead::SizeTooSmall) => {
                        if service_info.is_empty() && remaining == mtu as usize {
                            return Err(ProtocolError::Malformed {
                                context: "device service info",
                                reason: "service info KV exceeds negotiated MTU".into(),
                            }
                            .into());
                        }
                        is_more = true;
                        break;
                    }
                    Ok(ChunkRead::End) => break,
                    Err(PipeError::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => return Err(e.into()),
                }
            }

            // Nothing to send and the owner reported no pending data: this
            // poll only asks whether the owner is done, so pace it.
            if service_info.is_empty() && !is_more && !*prev_owner_more {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.config.service_info_poll_delay) => {}
                }
            }

            let resp = self
                .exchange(
                    base_url,
                    "DeviceServiceInfo",
                    msg::DEVICE_SERVICE_INFO,
                    msg::device_service_info(is_more, &service_info),
                    msg::OWNER_SERVICE_INFO,
                    ctx.max_owner_message_size,
                    cancel,
                )
                .await?;
            let owner = msg::decode_owner_service_info(cbor::from_slice(&resp)?)?;

            for kv in owner.service_info {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    result = owner_tx.write_chunk(kv) => result?,
                }
            }
            if !owner.is_more {
                owner_tx.close();
            }
            *prev_owner_more = owner.is_more;

            if is_more || owner.is_more {
                continue;
            }
            return Ok(owner.is_done);
        }
    }

    /// Done(70) -> Done2(71): the closing nonce exchange.
    async fn done(&self, base_url: &str, ctx: &To2Context, cancel: &CancellationToken) -> Result<()> {
        let setup_device_nonce = ctx
            .setup_device_nonce
            .ok_or(ProtocolError::MissingField("setup device nonce"))?;

        let resp = self
            .exchange(
                base_url,
                "Done",
                msg::DONE,
                msg::done(&ctx.prove_device_nonce),
                msg::DONE2,
                ctx.max_owner_message_size,
                cancel,
            )
            .await?;

        let echoed = msg::decode_done2(cbor::from_slice(&resp)?)?;
        if echoed != setup_device_nonce {
            return Err(ProtocolError::NonceMismatch {
                request: "Done",
                response: "Done2",
            }
            .into());
        }
        Ok(())
    }
}
