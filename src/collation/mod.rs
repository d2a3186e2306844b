// Title collation.
//
// Volumes are ordered by a collation key derived from each title: comparing
// two keys bytewise must give the linguistic order of the titles. A real
// locale-aware collator (ICU or similar) is plugged in by implementing
// `Collator`, or by passing any `Fn(&str) -> Vec<u8>`.

use crate::encoding::Encode;

pub trait Collator: Send + Sync {
    fn sort_key(&self, title: &str) -> Vec<u8>;
}

impl<F> Collator for F
where
    F: Fn(&str) -> Vec<u8> + Send + Sync,
{
    fn sort_key(&self, title: &str) -> Vec<u8> {
        self(title)
    }
}

/// Orders titles by their UTF-8 bytes, i.e. by code point.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCollator;

impl Collator for BinaryCollator {
    fn sort_key(&self, title: &str) -> Vec<u8> {
        title.as_bytes().to_vec()
    }
}

/// Two-level collation: titles compare case-insensitively first, and only
/// titles equal under case folding are ordered by their exact spelling,
/// lowercase before uppercase.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldingCollator;

impl Collator for FoldingCollator {
    fn sort_key(&self, title: &str) -> Vec<u8> {
        let primary = title.to_lowercase();
        // Swapping case makes lowercase sort first among otherwise equal titles.
        let tertiary: String = title
            .chars()
            .map(|c| {
                if c.is_lowercase() {
                    c.to_uppercase().next().unwrap_or(c)
                } else {
                    c.to_lowercase().next().unwrap_or(c)
                }
            })
            .collect();
        (primary, tertiary).encode()
    }
}
