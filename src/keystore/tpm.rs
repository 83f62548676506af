//! Keystore whose device root secret is sealed by a TPM 2.0.
//!
//! The root secret is generated from TPM randomness on first open, encrypted
//! under an AES-128-CFB child key of an owner-hierarchy primary, and kept
//! in the kv store together with the child key blobs. Later opens recreate
//! the (deterministic) primary, load the child and unseal the root. Working
//! keys are derived from the root per handle exactly like
//! [`MemoryKeystore`](super::MemoryKeystore) does, so only the root is ever
//! at rest, and only TPM-encrypted.

use std::time::Duration;

use bincode::{Decode, Encode};
use tracing::{debug, error, info, instrument, trace, warn};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::{AlgorithmIdentifier, CapabilityType};
use tss_esapi::handles::KeyHandle as TpmKeyHandle;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, SymmetricMode};
use tss_esapi::interface_types::key_bits::AesKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::{
    CapabilityData, CreateKeyResult, Digest, InitialValue, MaxBuffer, Private, Public,
    PublicBuilder, SymmetricCipherParameters, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TabrmdConfig;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::{Context, TctiNameConf};
use tpm2_rand::TpmRand;
use zeroize::Zeroizing;

use super::{KEY_ID_LEN, KeyHandle, KeySpec, Keystore, authorize};
use crate::crypt::{KEY_SIZE, KeyMaterial, Nonce};
use crate::error::KeystoreError;
use crate::kv::{Collection, KvStore};
use crate::presence::{EnrollmentFingerprint, PresenceGate};

const KEYSTORE_COLLECTION: &str = "keystore";
const SEALED_ROOT_SLOT: &str = "root";
const AES_BLOCK_SIZE: usize = 16;

/// TCTI from the `TCTI` environment variable, or the tabrmd default.
pub fn default_tcti() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or(TctiNameConf::Tabrmd(TabrmdConfig::default()))
}

/// Device root secret as stored at rest.
#[derive(Encode, Decode, Debug, Clone)]
struct SealedRoot {
    /// Marshalled TPM2B_PUBLIC of the sealing child key.
    public: Vec<u8>,
    /// TPM2B_PRIVATE of the sealing child key, only loadable by this TPM.
    private: Vec<u8>,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
}

/// Persistent metadata of one generated key. The key bytes are never stored.
#[derive(Encode, Decode, Debug, Clone)]
struct TpmKeyRecord {
    alias: String,
    id: [u8; KEY_ID_LEN],
    validity_secs: u64,
    require_presence: bool,
    enrollment: EnrollmentFingerprint,
    invalidated: bool,
}

impl TpmKeyRecord {
    fn handle(&self) -> KeyHandle {
        KeyHandle::new(self.alias.clone(), self.id)
    }
}

fn tpm_err(e: tss_esapi::Error) -> KeystoreError {
    KeystoreError::Backend(format!("tpm: {e}"))
}

fn kv_err(e: sled::Error) -> KeystoreError {
    KeystoreError::Backend(format!("kv: {e}"))
}

fn encode<T: Encode>(value: &T) -> Result<Vec<u8>, KeystoreError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| KeystoreError::Backend(format!("encode: {e}")))
}

fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T, KeystoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| KeystoreError::Backend(format!("decode: {e}")))
}

/// Whether the TPM offers the AES-CFB scheme the root is sealed with.
pub fn is_aes_supported(ctx: &mut Context) -> Result<bool, tss_esapi::Error> {
    let (data, _) = ctx.get_capability(CapabilityType::Algorithms, 0, 50)?;

    if let CapabilityData::Algorithms(algorithms) = data {
        let has = |id| algorithms.iter().any(|algo| algo.algorithm_identifier() == id);
        Ok(has(AlgorithmIdentifier::Aes) && has(AlgorithmIdentifier::Cfb))
    } else {
        error!("Unexpected capability data type: {:?}", data);
        Err(tss_esapi::Error::WrapperError(
            tss_esapi::WrapperErrorKind::UnsupportedParam,
        ))
    }
}

/// AES primary plus per-seal child keys.
struct TpmSealer {
    ctx: Context,
    primary: TpmKeyHandle,
}

impl TpmSealer {
    /// Create the AES-128-CFB primary under the owner hierarchy. The same
    /// template always yields the same key, so sealed blobs stay loadable
    /// across reboots.
    #[instrument(level = "debug", skip(ctx))]
    fn new(mut ctx: Context) -> Result<Self, tss_esapi::Error> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_st_clear(false)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            // sign must be clear for a symmetric parent
            .with_restricted(true)
            .build()?;

        let public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::SymCipher)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
                SymmetricDefinitionObject::AES_128_CFB,
            ))
            .with_symmetric_cipher_unique_identifier(Digest::default())
            .build()?;

        trace!(?public, "creating symmetric primary key");
        let primary = ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
            })?
            .key_handle;

        Ok(Self { ctx, primary })
    }

    fn child_template() -> Result<Public, tss_esapi::Error> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_st_clear(false)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_sign_encrypt(true)
            .with_decrypt(true)
            .with_restricted(false)
            .build()?;

        PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::SymCipher)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
                SymmetricDefinitionObject::Aes {
                    key_bits: AesKeyBits::Aes128,
                    mode: SymmetricMode::Cfb,
                },
            ))
            .with_symmetric_cipher_unique_identifier(Digest::default())
            .build()
    }

    #[instrument(level = "debug", skip_all)]
    fn seal(&mut self, secret: &[u8]) -> Result<SealedRoot, tss_esapi::Error> {
        let primary = self.primary;
        let template = Self::child_template()?;
        let (private, public) = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create(primary, template.clone(), None, None, None, None)
                .map(|key: CreateKeyResult| (key.out_private, key.out_public))
        })?;
        let child = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.load(primary, private.clone(), public.clone())
        })?;

        let iv = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.get_random(InitialValue::MAX_SIZE).and_then(|random| {
                InitialValue::try_from(random.to_vec()).map_err(|_| {
                    tss_esapi::Error::WrapperError(tss_esapi::WrapperErrorKind::InvalidParam)
                })
            })
        })?;

        let padded = Zeroizing::new(pkcs7_pad(secret));
        let data = MaxBuffer::try_from(padded.to_vec()).map_err(|_| {
            tss_esapi::Error::WrapperError(tss_esapi::WrapperErrorKind::InvalidParam)
        })?;
        let result = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.encrypt_decrypt_2(child, false, SymmetricMode::Cfb, data, iv.clone())
        });
        self.flush(child);
        let (ciphertext, _) = result?;

        Ok(SealedRoot {
            public: public.marshall()?,
            private: private.to_vec(),
            iv: iv.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }

    #[instrument(level = "debug", skip_all)]
    fn unseal(&mut self, sealed: &SealedRoot) -> Result<Zeroizing<Vec<u8>>, tss_esapi::Error> {
        let public = Public::unmarshall(&sealed.public)?;
        let private = Private::try_from(sealed.private.clone())?;
        let iv = InitialValue::try_from(sealed.iv.clone())?;
        let data = MaxBuffer::try_from(sealed.ciphertext.clone())?;

        let primary = self.primary;
        let child = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))?;
        let result = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.encrypt_decrypt_2(child, true, SymmetricMode::Cfb, data, iv)
        });
        self.flush(child);
        let (padded, _) = result?;

        let padded = Zeroizing::new(padded.to_vec());
        pkcs7_unpad(&padded).map(Zeroizing::new)
    }

    fn flush(&mut self, handle: TpmKeyHandle) {
        if let Err(e) = self.ctx.flush_context(handle.into()) {
            warn!(error = %e, "failed to flush transient key");
        }
    }
}

impl Drop for TpmSealer {
    fn drop(&mut self) {
        let primary = self.primary;
        self.flush(primary);
    }
}

/// A [`Keystore`] backed by a TPM-sealed device root secret.
pub struct TpmKeystore {
    root: Option<KeyMaterial>,
    records: Collection,
    gate: PresenceGate,
}

impl TpmKeystore {
    /// Connect to the TPM and unseal (or create) the device root secret.
    ///
    /// A TPM without AES-CFB yields an unsupported keystore rather than an
    /// error, so the store can fall back to passthrough mode.
    #[instrument(level = "debug", skip(kv, gate))]
    pub fn open(
        kv: &KvStore,
        tcti: TctiNameConf,
        gate: PresenceGate,
    ) -> Result<Self, KeystoreError> {
        let records = kv.collection(KEYSTORE_COLLECTION);
        let mut ctx = Context::new(tcti).map_err(tpm_err)?;

        if !is_aes_supported(&mut ctx).map_err(tpm_err)? {
            warn!("TPM does not support AES-CFB, keystore unavailable");
            return Ok(Self {
                root: None,
                records,
                gate,
            });
        }

        let root = match records.get(SEALED_ROOT_SLOT).map_err(kv_err)? {
            Some(raw) => {
                let sealed: SealedRoot = decode(&raw)?;
                let secret = TpmSealer::new(ctx)
                    .and_then(|mut sealer| sealer.unseal(&sealed))
                    .map_err(tpm_err)?;
                info!("unsealed device root secret");
                KeyMaterial::from_slice(&secret)?
            }
            None => {
                let mut rng = TpmRand::new(ctx);
                let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
                rng.try_fill(&mut secret[..]).map_err(tpm_err)?;
                let root = KeyMaterial::from_slice(&secret[..])?;

                let sealed = TpmSealer::new(rng.into_inner())
                    .and_then(|mut sealer| sealer.seal(root.expose()))
                    .map_err(tpm_err)?;
                records
                    .insert(SEALED_ROOT_SLOT, encode(&sealed)?)
                    .map_err(kv_err)?;
                info!("sealed new device root secret");
                root
            }
        };

        Ok(Self {
            root: Some(root),
            records,
            gate,
        })
    }

    pub fn presence(&self) -> &PresenceGate {
        &self.gate
    }

    fn root(&self) -> Result<&KeyMaterial, KeystoreError> {
        self.root.as_ref().ok_or(KeystoreError::NotSupported)
    }

    fn slot(alias: &str) -> String {
        format!("key:{alias}")
    }

    fn record(&self, alias: &str) -> Result<Option<TpmKeyRecord>, KeystoreError> {
        self.root()?;
        match self.records.get(&Self::slot(alias)).map_err(kv_err)? {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    fn store_record(&self, record: &TpmKeyRecord) -> Result<(), KeystoreError> {
        self.records
            .insert(&Self::slot(&record.alias), encode(record)?)
            .map_err(kv_err)
    }

    fn working_key(&self, key: &KeyHandle) -> Result<KeyMaterial, KeystoreError> {
        let mut record = self
            .record(key.alias())?
            .filter(|record| record.id == *key.id())
            .ok_or_else(|| KeystoreError::KeyNotFound(key.alias().to_string()))?;

        let verdict = authorize(
            key.alias(),
            &record.enrollment,
            record.invalidated,
            Duration::from_secs(record.validity_secs),
            record.require_presence,
            &self.gate,
        );
        if let Err(KeystoreError::KeyPermanentlyInvalidated { .. }) = &verdict {
            if !record.invalidated {
                warn!(alias = key.alias(), "key invalidated by enrollment change");
                record.invalidated = true;
                self.store_record(&record)?;
            }
        }
        verdict?;

        self.root()?.derive(key.id(), key.alias().as_bytes())
    }
}

impl Keystore for TpmKeystore {
    fn is_supported(&self) -> bool {
        self.root.is_some()
    }

    fn get(&self, alias: &str) -> Result<Option<KeyHandle>, KeystoreError> {
        Ok(self.record(alias)?.map(|record| record.handle()))
    }

    #[instrument(level = "debug", skip(self, spec), fields(alias = %spec.alias))]
    fn generate(&self, spec: &KeySpec) -> Result<KeyHandle, KeystoreError> {
        self.root()?;
        let handle = KeyHandle::generate(spec.alias.clone());
        let record = TpmKeyRecord {
            alias: spec.alias.clone(),
            id: *handle.id(),
            validity_secs: spec.validity.as_secs(),
            require_presence: spec.require_presence,
            enrollment: self.gate.enrollment(),
            invalidated: false,
        };
        self.store_record(&record)?;
        info!(?handle, "generated key");
        Ok(handle)
    }

    fn delete(&self, alias: &str) -> Result<bool, KeystoreError> {
        self.root()?;
        let removed = self.records.remove(&Self::slot(alias)).map_err(kv_err)?;
        if removed {
            debug!(alias, "deleted key record");
        }
        Ok(removed)
    }

    fn seal(
        &self,
        key: &KeyHandle,
        nonce: &Nonce,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.working_key(key)?.seal(nonce, plaintext)
    }

    fn open(
        &self,
        key: &KeyHandle,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.working_key(key)?.open(nonce, ciphertext)
    }
}

fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    // always pads, even for block-aligned input
    let padding = AES_BLOCK_SIZE - (data.len() % AES_BLOCK_SIZE);
    let mut padded = data.to_vec();
    padded.resize(data.len() + padding, padding as u8);
    padded
}

fn pkcs7_unpad(data: &[u8]) -> Result<Vec<u8>, tss_esapi::Error> {
    let invalid = tss_esapi::Error::WrapperError(tss_esapi::WrapperErrorKind::InvalidParam);
    let Some(&last) = data.last() else {
        return Err(invalid);
    };
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > AES_BLOCK_SIZE || data.len() < pad_len {
        return Err(invalid);
    }
    let (body, padding) = data.split_at(data.len() - pad_len);
    if padding.iter().any(|&b| b != last) {
        return Err(invalid);
    }
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tss_esapi::tcti_ldr::NetworkTPMConfig;

    fn test_tcti() -> TctiNameConf {
        TctiNameConf::from_environment_variable()
            .unwrap_or(TctiNameConf::Swtpm(NetworkTPMConfig::default()))
    }

    #[test]
    fn test_pkcs7() {
        let padded = pkcs7_pad(&[7u8; 32]);
        assert_eq!(padded.len(), 48);
        assert_eq!(&padded[32..], &[16u8; 16]);
        assert_eq!(pkcs7_unpad(&padded).unwrap(), vec![7u8; 32]);

        assert!(pkcs7_unpad(&[]).is_err());
        assert!(pkcs7_unpad(&[1, 2, 3, 0]).is_err());
        assert!(pkcs7_unpad(&[1, 2, 2, 3]).is_err());
    }

    #[test]
    fn test_record_encoding() {
        let record = TpmKeyRecord {
            alias: "credstore-aes-key".into(),
            id: [9u8; KEY_ID_LEN],
            validity_secs: 600,
            require_presence: true,
            enrollment: [1u8; 32],
            invalidated: false,
        };
        let decoded: TpmKeyRecord = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(decoded.handle(), record.handle());
        assert_eq!(decoded.validity_secs, 600);
    }

    #[test]
    #[serial]
    #[ignore = "requires a TPM or swtpm"]
    fn test_root_survives_reopen() {
        let kv = KvStore::temporary().unwrap();
        let ks = TpmKeystore::open(&kv, test_tcti(), PresenceGate::confirmed()).unwrap();
        assert!(ks.is_supported());

        let handle = ks.generate(&KeySpec::new("tpm-test")).unwrap();
        let nonce = [5u8; 12];
        let ciphertext = ks.seal(&handle, &nonce, b"sealed by tpm").unwrap();
        drop(ks);

        let ks = TpmKeystore::open(&kv, test_tcti(), PresenceGate::confirmed()).unwrap();
        assert_eq!(ks.get("tpm-test").unwrap(), Some(handle.clone()));
        assert_eq!(ks.open(&handle, &nonce, &ciphertext).unwrap(), b"sealed by tpm");
    }

    #[test]
    #[serial]
    #[ignore = "requires a TPM or swtpm"]
    fn test_invalidation_is_persisted() {
        let kv = KvStore::temporary().unwrap();
        let ks = TpmKeystore::open(&kv, test_tcti(), PresenceGate::confirmed()).unwrap();
        let handle = ks.generate(&KeySpec::new("tpm-test")).unwrap();

        ks.presence().enroll(b"another credential");
        assert!(matches!(
            ks.seal(&handle, &[0u8; 12], b"x"),
            Err(KeystoreError::KeyPermanentlyInvalidated { .. })
        ));
        drop(ks);

        // back on the original enrollment, the key stays dead
        let ks = TpmKeystore::open(&kv, test_tcti(), PresenceGate::confirmed()).unwrap();
        assert!(matches!(
            ks.seal(&handle, &[0u8; 12], b"x"),
            Err(KeystoreError::KeyPermanentlyInvalidated { .. })
        ));
    }
}
