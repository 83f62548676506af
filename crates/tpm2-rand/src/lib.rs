use rand_core::{CryptoRng, RngCore};
use tss_esapi::Context;

/// Largest request a TPM2_GetRandom call is guaranteed to satisfy
/// (the size of a SHA-384 digest on most parts).
pub const MAX_TPM_RANDOM_BUF: usize = 48;

/// Random number generator backed by `TPM2_GetRandom`.
pub struct TpmRand {
    tpm_context: Context,
}

impl TpmRand {
    pub fn new(ctx: Context) -> Self {
        Self { tpm_context: ctx }
    }

    /// Fill `dest` from the TPM, surfacing TPM errors instead of panicking.
    pub fn try_fill(&mut self, dest: &mut [u8]) -> Result<(), tss_esapi::Error> {
        let mut offset = 0;
        while offset < dest.len() {
            let chunk_size = core::cmp::min(MAX_TPM_RANDOM_BUF, dest.len() - offset);
            let random_bytes = self.tpm_context.get_random(chunk_size)?;
            let bytes = random_bytes.value();
            // The TPM may hand back fewer bytes than requested
            let got = core::cmp::min(bytes.len(), chunk_size);
            dest[offset..offset + got].copy_from_slice(&bytes[..got]);
            offset += got;
        }
        Ok(())
    }

    /// Give the context back, e.g. to reuse it for sealing.
    pub fn into_inner(self) -> Context {
        self.tpm_context
    }
}

impl RngCore for TpmRand {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill(dest)
            .expect("Failed to get random bytes from TPM");
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.try_fill(dest).map_err(rand_core::Error::new)
    }
}

impl CryptoRng for TpmRand {}
