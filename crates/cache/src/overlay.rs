use apkswap_apk::Apk;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifies the code currently running on a device for one application:
/// the APKs of the last full install plus every swap layered on top of it.
///
/// Chained like a hash list, so two devices that received the same install
/// followed by the same swaps end up with equal identifiers.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("{checksum}")]
pub struct OverlayId {
    checksum: String,
    base_install: bool,
}

impl OverlayId {
    /// Identifier of a plain install with no swaps applied.
    pub fn base_install(apks: &[Apk]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"install");
        hash_apks(&mut hasher, apks);
        Self { checksum: hasher.finalize().to_string(), base_install: true }
    }

    /// Identifier after swapping `classes` from `apks` on top of `self`.
    pub fn next(&self, apks: &[Apk], classes: &[String]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"swap");
        hasher.update(self.checksum.as_bytes());
        hash_apks(&mut hasher, apks);
        let mut classes: Vec<&str> = classes.iter().map(String::as_str).collect();
        classes.sort_unstable();
        for class in classes {
            hasher.update(class.as_bytes());
            hasher.update(&[0]);
        }
        Self { checksum: hasher.finalize().to_string(), base_install: false }
    }

    pub fn is_base_install(&self) -> bool {
        self.base_install
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

fn hash_apks(hasher: &mut blake3::Hasher, apks: &[Apk]) {
    let mut apks: Vec<(&str, &str)> = apks.iter().map(|apk| (apk.name.as_str(), apk.checksum.as_str())).collect();
    apks.sort_unstable();
    for (name, checksum) in apks {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(checksum.as_bytes());
        hasher.update(&[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apk(name: &str, checksum: &str) -> Apk {
        Apk { name: name.into(), checksum: checksum.into(), path: None, entries: Default::default() }
    }

    #[test]
    fn base_install_ignores_apk_order() {
        let a = OverlayId::base_install(&[apk("base.apk", "1"), apk("split.apk", "2")]);
        let b = OverlayId::base_install(&[apk("split.apk", "2"), apk("base.apk", "1")]);
        assert_eq!(a, b);
        assert!(a.is_base_install());
        assert_ne!(a, OverlayId::base_install(&[apk("base.apk", "3"), apk("split.apk", "2")]));
    }

    #[test]
    fn swaps_chain_from_the_previous_overlay() {
        let apks = [apk("base.apk", "1")];
        let base = OverlayId::base_install(&apks);
        let first = base.next(&apks, &["a.B".into(), "a.A".into()]);
        assert!(!first.is_base_install());
        assert_eq!(first, base.next(&apks, &["a.A".into(), "a.B".into()]));
        assert_ne!(first.next(&apks, &["a.A".into()]), base.next(&apks, &["a.A".into()]));
    }
}
