//! DRM detection and deferred resolution
//!
//! A protected publication is parsed without its credential. Detection only looks
//! for a license marker in the container and yields an unresolved [`Drm`]; the
//! caller later hands the credential, or nothing, to the [`DrmResolver`] returned
//! alongside the publication. The resolver settles the shared [`DrmHolder`] once,
//! reads running at that moment observe either the previous or the new state.

use std::{
    fmt::{Debug, Display},
    sync::{Arc, RwLock},
};

use log::{debug, info};

use crate::{archive::ArchiveReader, error::EpubError};

/// Scheme URI of the Readium LCP DRM
pub const LCP_SCHEME: &str = "http://readium.org/2014/01/lcp";

/// Scheme URI of the Adobe ADEPT DRM
pub const ADEPT_SCHEME: &str = "http://ns.adobe.com/adept";

/// Key retrieval URI used by LCP in `META-INF/encryption.xml`
pub const LCP_KEY_RETRIEVAL: &str = "license.lcpl#/encryption/content_key";

/// Brand of a DRM scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrmBrand {
    Lcp,
    Adept,
    Other(String),
}

impl Display for DrmBrand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrmBrand::Lcp => f.write_str("LCP"),
            DrmBrand::Adept => f.write_str("Adobe ADEPT"),
            DrmBrand::Other(name) => f.write_str(name),
        }
    }
}

/// A credential able to decipher the resources protected by a DRM
///
/// The cryptographic primitives are supplied by the caller; with the `aes`
/// feature the crate provides [`ContentKeyLicense`] for licenses exposing a raw
/// AES-256 content key.
pub trait DrmLicense: Send + Sync {
    /// Deciphers `data` encrypted with the `algorithm` URI of its encryption record
    ///
    /// Implementations return [`EpubError::UnsupportedEncryptedMethod`] for an
    /// algorithm they do not handle and [`EpubError::DecryptionFailed`] when the
    /// ciphertext cannot be deciphered.
    fn decipher(&self, algorithm: &str, data: &[u8]) -> Result<Vec<u8>, EpubError>;
}

/// DRM descriptor of a publication
#[derive(Clone)]
pub struct Drm {
    pub brand: DrmBrand,

    /// Scheme URI identifying the DRM
    pub scheme: String,

    /// `KeyInfo/RetrievalMethod` URI marking the encryption records of this DRM
    pub key_retrieval: Option<String>,

    /// The credential, only set once the DRM is resolved
    pub license: Option<Arc<dyn DrmLicense>>,
}

impl Drm {
    pub fn new(brand: DrmBrand, scheme: &str) -> Self {
        Self {
            brand,
            scheme: scheme.to_string(),
            key_retrieval: None,
            license: None,
        }
    }

    pub fn with_key_retrieval(mut self, uri: &str) -> Self {
        self.key_retrieval = Some(uri.to_string());
        self
    }
}

impl Debug for Drm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drm")
            .field("brand", &self.brand)
            .field("scheme", &self.scheme)
            .field("key_retrieval", &self.key_retrieval)
            .field("license", &self.license.as_ref().map(|_| "<license>"))
            .finish()
    }
}

/// Probes a container for the license marker of one DRM scheme
pub trait DrmDetector: Send + Sync {
    fn detect(&self, archive: &dyn ArchiveReader) -> Option<Drm>;
}

/// Detects Readium LCP through `META-INF/license.lcpl`
pub struct LcpDetector;

impl LcpDetector {
    pub const LICENSE_PATH: &'static str = "META-INF/license.lcpl";
}

impl DrmDetector for LcpDetector {
    fn detect(&self, archive: &dyn ArchiveReader) -> Option<Drm> {
        archive
            .contains(Self::LICENSE_PATH)
            .then(|| Drm::new(DrmBrand::Lcp, LCP_SCHEME).with_key_retrieval(LCP_KEY_RETRIEVAL))
    }
}

/// Detects Adobe ADEPT through `META-INF/rights.xml`
pub struct AdeptDetector;

impl AdeptDetector {
    pub const RIGHTS_PATH: &'static str = "META-INF/rights.xml";
}

impl DrmDetector for AdeptDetector {
    fn detect(&self, archive: &dyn ArchiveReader) -> Option<Drm> {
        archive
            .contains(Self::RIGHTS_PATH)
            .then(|| Drm::new(DrmBrand::Adept, ADEPT_SCHEME))
    }
}

/// The detectors registered by default, LCP first
pub fn default_detectors() -> Vec<Arc<dyn DrmDetector>> {
    vec![Arc::new(LcpDetector), Arc::new(AdeptDetector)]
}

/// Runs the detectors in order, the first detected DRM wins
pub fn detect_drm(archive: &dyn ArchiveReader, detectors: &[Arc<dyn DrmDetector>]) -> Option<Drm> {
    let drm = detectors.iter().find_map(|detector| detector.detect(archive));
    if let Some(drm) = &drm {
        debug!("Detected {} DRM ({}).", drm.brand, drm.scheme);
    }
    drm
}

/// Resolution state of the DRM of a publication
#[derive(Debug, Clone)]
pub enum DrmState {
    /// No license marker was found
    NoDrm,

    /// A DRM was detected, its credential has not been supplied yet
    Unresolved(Drm),

    /// The credential is attached to the DRM
    Resolved(Drm),

    /// The caller declined to supply a credential
    Abandoned(Drm),
}

impl DrmState {
    pub fn drm(&self) -> Option<&Drm> {
        match self {
            DrmState::NoDrm => None,
            DrmState::Unresolved(drm) | DrmState::Resolved(drm) | DrmState::Abandoned(drm) => {
                Some(drm)
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, DrmState::Resolved(_))
    }
}

/// Shared, mutable-once holder of the [`DrmState`]
///
/// The lock is only held to clone a snapshot or to swap the state.
#[derive(Debug)]
pub struct DrmHolder {
    state: RwLock<DrmState>,
}

impl DrmHolder {
    pub fn new(drm: Option<Drm>) -> Self {
        let state = match drm {
            Some(drm) => DrmState::Unresolved(drm),
            None => DrmState::NoDrm,
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Returns a copy of the current state
    pub fn snapshot(&self) -> Result<DrmState, EpubError> {
        Ok(self.state.read()?.clone())
    }

    /// Moves an unresolved DRM to `Resolved` or `Abandoned`
    ///
    /// A DRM can only be settled once: settling a resolved or abandoned DRM fails
    /// with [`EpubError::DrmAlreadySettled`] and leaves the state unchanged.
    pub(crate) fn settle(
        &self,
        license: Option<Arc<dyn DrmLicense>>,
    ) -> Result<DrmState, EpubError> {
        let mut state = self.state.write()?;
        let next = match &*state {
            DrmState::NoDrm => return Err(EpubError::NoDrmToResolve),
            DrmState::Resolved(_) | DrmState::Abandoned(_) => {
                return Err(EpubError::DrmAlreadySettled);
            }
            DrmState::Unresolved(drm) => {
                let mut drm = drm.clone();
                match license {
                    Some(license) => {
                        drm.license = Some(license);
                        DrmState::Resolved(drm)
                    }
                    None => DrmState::Abandoned(drm),
                }
            }
        };

        *state = next.clone();
        Ok(next)
    }
}

/// One-shot continuation resolving the DRM of a parsed publication
///
/// Consumed by [`DrmResolver::resolve`].
pub struct DrmResolver {
    holder: Arc<DrmHolder>,
}

impl DrmResolver {
    pub(crate) fn new(holder: Arc<DrmHolder>) -> Self {
        Self { holder }
    }

    /// Supplies the credential of the publication, or `None` to abandon the resolution
    ///
    /// ## Return
    /// - `Ok(DrmState)`: The new state, `Resolved` or `Abandoned`
    /// - `Err(EpubError::NoDrmToResolve)`: The publication is not protected
    /// - `Err(EpubError::DrmAlreadySettled)`: The DRM was settled already
    pub fn resolve(self, license: Option<Arc<dyn DrmLicense>>) -> Result<DrmState, EpubError> {
        let state = self.holder.settle(license)?;
        match &state {
            DrmState::Resolved(drm) => info!("The {} DRM has been resolved.", drm.brand),
            DrmState::Abandoned(drm) => info!("The {} DRM resolution was abandoned.", drm.brand),
            _ => {}
        }
        Ok(state)
    }

    pub fn state(&self) -> Result<DrmState, EpubError> {
        self.holder.snapshot()
    }
}

#[cfg(feature = "aes")]
pub use content_key::ContentKeyLicense;

#[cfg(feature = "aes")]
mod content_key {
    use aes::{
        Aes256,
        cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7},
    };

    use crate::{drm::DrmLicense, error::EpubError};

    type Aes256CbcDec = cbc::Decryptor<Aes256>;

    const BLOCK_SIZE: usize = 16;
    const KEY_SIZE: usize = 32;

    /// License holding a raw AES-256 content key
    ///
    /// Deciphers resources encrypted with `http://www.w3.org/2001/04/xmlenc#aes256-cbc`:
    /// the initialization vector is the first block of the data and the plaintext
    /// is padded with PKCS#7.
    pub struct ContentKeyLicense {
        key: [u8; KEY_SIZE],
    }

    impl ContentKeyLicense {
        pub const AES256_CBC: &'static str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";

        pub fn new(content_key: &[u8]) -> Result<Self, EpubError> {
            let key = <[u8; KEY_SIZE]>::try_from(content_key).map_err(|_| {
                failure(&format!("invalid content key length {}", content_key.len()))
            })?;
            Ok(Self { key })
        }
    }

    impl DrmLicense for ContentKeyLicense {
        fn decipher(&self, algorithm: &str, data: &[u8]) -> Result<Vec<u8>, EpubError> {
            if algorithm != Self::AES256_CBC {
                return Err(EpubError::UnsupportedEncryptedMethod {
                    method: algorithm.to_string(),
                });
            }

            if data.len() < BLOCK_SIZE * 2 || data.len() % BLOCK_SIZE != 0 {
                return Err(failure("ciphertext is not a whole number of blocks"));
            }

            let (iv, ciphertext) = data.split_at(BLOCK_SIZE);
            let cipher = Aes256CbcDec::new_from_slices(&self.key, iv)
                .map_err(|_| failure("invalid AES key/iv"))?;
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| failure("invalid PKCS#7 padding"))
        }
    }

    fn failure(reason: &str) -> EpubError {
        EpubError::DecryptionFailed {
            resource: String::new(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    mod detector_tests {
        use std::sync::Arc;

        use crate::{
            archive::ArchiveReader,
            drm::{
                ADEPT_SCHEME, AdeptDetector, Drm, DrmBrand, DrmDetector, LCP_KEY_RETRIEVAL,
                LCP_SCHEME, default_detectors, detect_drm,
            },
            test_support::ArchiveBuilder,
        };

        #[test]
        fn test_detect_lcp() {
            let archive = ArchiveBuilder::new()
                .file("META-INF/license.lcpl", "{}")
                .open();
            let drm = detect_drm(archive.as_ref(), &default_detectors()).unwrap();
            assert_eq!(drm.brand, DrmBrand::Lcp);
            assert_eq!(drm.scheme, LCP_SCHEME);
            assert_eq!(drm.key_retrieval.as_deref(), Some(LCP_KEY_RETRIEVAL));
            assert!(drm.license.is_none());
        }

        #[test]
        fn test_detect_adept() {
            let archive = ArchiveBuilder::new()
                .file("META-INF/rights.xml", "<rights/>")
                .open();
            let drm = detect_drm(archive.as_ref(), &default_detectors()).unwrap();
            assert_eq!(drm.brand, DrmBrand::Adept);
            assert_eq!(drm.scheme, ADEPT_SCHEME);
        }

        #[test]
        fn test_detect_nothing() {
            let archive = ArchiveBuilder::new().file("content.opf", "<package/>").open();
            assert!(detect_drm(archive.as_ref(), &default_detectors()).is_none());
        }

        struct MarkerDetector;

        impl DrmDetector for MarkerDetector {
            fn detect(&self, archive: &dyn ArchiveReader) -> Option<Drm> {
                archive
                    .contains("META-INF/custom.drm")
                    .then(|| Drm::new(DrmBrand::Other("Custom".to_string()), "urn:custom"))
            }
        }

        /// Additional schemes are registered without touching the defaults
        #[test]
        fn test_registered_detector_order() {
            let archive = ArchiveBuilder::new()
                .file("META-INF/custom.drm", "")
                .file("META-INF/rights.xml", "<rights/>")
                .open();

            let detectors: Vec<Arc<dyn DrmDetector>> =
                vec![Arc::new(MarkerDetector), Arc::new(AdeptDetector)];
            let drm = detect_drm(archive.as_ref(), &detectors).unwrap();
            assert_eq!(drm.brand, DrmBrand::Other("Custom".to_string()));
            assert_eq!(drm.brand.to_string(), "Custom");
        }
    }

    mod resolution_tests {
        use std::sync::Arc;

        use crate::{
            drm::{Drm, DrmBrand, DrmHolder, DrmResolver, DrmState, LCP_SCHEME},
            error::EpubError,
            test_support::XorLicense,
        };

        fn unresolved() -> Arc<DrmHolder> {
            Arc::new(DrmHolder::new(Some(Drm::new(DrmBrand::Lcp, LCP_SCHEME))))
        }

        #[test]
        fn test_resolve_with_license() {
            let holder = unresolved();
            assert!(matches!(
                holder.snapshot().unwrap(),
                DrmState::Unresolved(_)
            ));

            let resolver = DrmResolver::new(holder.clone());
            match resolver.state().unwrap() {
                DrmState::Unresolved(drm) => assert_eq!(drm.brand, DrmBrand::Lcp),
                other => panic!("unexpected state {:?}", other),
            }

            let state = resolver.resolve(Some(Arc::new(XorLicense::new(7))));
            assert!(state.is_ok());
            assert!(state.unwrap().is_resolved());

            let snapshot = holder.snapshot().unwrap();
            assert!(snapshot.drm().unwrap().license.is_some());
        }

        #[test]
        fn test_resolve_without_license_abandons() {
            let holder = unresolved();
            let state = DrmResolver::new(holder.clone()).resolve(None).unwrap();
            assert!(matches!(state, DrmState::Abandoned(_)));
            assert!(matches!(holder.snapshot().unwrap(), DrmState::Abandoned(_)));
        }

        /// A settled DRM never changes again
        #[test]
        fn test_second_resolution_is_rejected() {
            let holder = unresolved();
            DrmResolver::new(holder.clone()).resolve(None).unwrap();

            let result = DrmResolver::new(holder.clone()).resolve(Some(Arc::new(XorLicense::new(1))));
            assert_eq!(result.unwrap_err(), EpubError::DrmAlreadySettled);
            assert!(matches!(holder.snapshot().unwrap(), DrmState::Abandoned(_)));
        }

        #[test]
        fn test_resolve_without_drm() {
            let holder = Arc::new(DrmHolder::new(None));
            let result = DrmResolver::new(holder.clone()).resolve(None);
            assert_eq!(result.unwrap_err(), EpubError::NoDrmToResolve);
            assert!(matches!(holder.snapshot().unwrap(), DrmState::NoDrm));
        }
    }

    #[cfg(feature = "aes")]
    mod content_key_tests {
        use crate::{
            drm::{ContentKeyLicense, DrmLicense},
            error::EpubError,
            test_support::aes256_cbc_encrypt as encrypt,
        };

        #[test]
        fn test_decipher_aes256_cbc() {
            let key = [0x42u8; 32];
            let iv = [0x24u8; 16];
            let plaintext = b"<html><body>Protected chapter with more than one block</body></html>";
            let ciphertext = encrypt(&key, &iv, plaintext);

            let license = ContentKeyLicense::new(&key).unwrap();
            let result = license.decipher(ContentKeyLicense::AES256_CBC, &ciphertext);
            assert!(result.is_ok());
            assert_eq!(result.unwrap(), plaintext.to_vec());
        }

        #[test]
        fn test_decipher_wrong_key_or_algorithm() {
            let ciphertext = encrypt(&[1u8; 32], &[2u8; 16], b"secret text");

            let license = ContentKeyLicense::new(&[3u8; 32]).unwrap();
            let result = license.decipher(ContentKeyLicense::AES256_CBC, &ciphertext);
            // A wrong key almost always breaks the padding; tolerate the rare valid one
            if let Err(err) = result {
                assert!(matches!(err, EpubError::DecryptionFailed { .. }));
            }

            let result = license.decipher("urn:unknown", &ciphertext);
            assert_eq!(
                result.unwrap_err(),
                EpubError::UnsupportedEncryptedMethod {
                    method: "urn:unknown".to_string()
                }
            );

            assert!(ContentKeyLicense::new(&[0u8; 16]).is_err());
        }

        /// Known answer from NIST SP 800-38A F.2.5, followed by a full padding block
        #[test]
        fn test_decipher_known_answer() {
            let key = [
                0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81,
                0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7, 0x2d, 0x98, 0x10, 0xa3, 0x09, 0x14, 0xdf, 0xf4,
            ];
            let mut data: Vec<u8> = (0u8..16).collect();
            data.extend([
                0xf5, 0x8c, 0x4c, 0x04, 0xd6, 0xe5, 0xf1, 0xba, 0x77, 0x9e, 0xab, 0xfb, 0x5f, 0x7b, 0xfb, 0xd6,
                0x48, 0x5a, 0x5c, 0x81, 0x51, 0x9c, 0xf3, 0x78, 0xfa, 0x36, 0xd4, 0x2b, 0x85, 0x47, 0xed, 0xc0,
            ]);

            let license = ContentKeyLicense::new(&key).unwrap();
            let result = license.decipher(ContentKeyLicense::AES256_CBC, &data);
            assert!(result.is_ok());
            assert_eq!(
                result.unwrap(),
                vec![
                    0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
                ]
            );
        }

        /// The last plaintext block ends with a zero byte, which is not PKCS#7
        #[test]
        fn test_decipher_invalid_padding() {
            let mut data = vec![0x24u8; 16];
            data.extend([
                0xf3, 0xbd, 0x05, 0x49, 0xfa, 0xac, 0x94, 0xa4, 0x1a, 0x5e, 0x14, 0x39, 0x6d, 0x29, 0xb6, 0x4a,
            ]);

            let license = ContentKeyLicense::new(&[0x42u8; 32]).unwrap();
            let result = license.decipher(ContentKeyLicense::AES256_CBC, &data);
            assert!(matches!(
                result,
                Err(EpubError::DecryptionFailed { ref reason, .. }) if reason == "invalid PKCS#7 padding"
            ));

            let result = license.decipher(ContentKeyLicense::AES256_CBC, &data[..24]);
            assert!(matches!(result, Err(EpubError::DecryptionFailed { .. })));
        }
    }
}
