//! Filename-based RGB/IR pairing for fusion runs.
//!
//! Names look like `rgb_<key>.<ext>` and `ir_<key>.<ext>`; the prefix is
//! case-insensitive, the key is not. Within one modality a later asset with the
//! same key replaces the earlier one but keeps its position.

use crate::model::InputAsset;
use std::collections::HashMap;

/// Result of partitioning a flat input set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PairingReport<'a> {
    pub pairs: Vec<(&'a InputAsset, &'a InputAsset)>,
    pub unpaired_rgb: Vec<&'a InputAsset>,
    pub unpaired_ir: Vec<&'a InputAsset>,
    pub invalid: Vec<&'a InputAsset>,
    /// Assets replaced by a later asset with the same modality and key.
    pub duplicates: Vec<&'a InputAsset>,
}

impl PairingReport<'_> {
    /// True when every asset found a partner and at least one pair exists.
    pub fn is_complete(&self) -> bool {
        !self.pairs.is_empty()
            && self.unpaired_rgb.is_empty()
            && self.unpaired_ir.is_empty()
            && self.invalid.is_empty()
    }

    /// Aggregate description of every offending item, `None` when complete.
    pub fn problems(&self) -> Option<String> {
        if self.is_complete() {
            return None;
        }
        let mut parts = Vec::new();
        if !self.invalid.is_empty() {
            parts.push(format!(
                "invalid file names (expected rgb_<id> or ir_<id>): {}",
                names(&self.invalid)
            ));
        }
        if !self.unpaired_rgb.is_empty() {
            parts.push(format!("RGB images without IR partner: {}", names(&self.unpaired_rgb)));
        }
        if !self.unpaired_ir.is_empty() {
            parts.push(format!("IR images without RGB partner: {}", names(&self.unpaired_ir)));
        }
        if self.pairs.is_empty() {
            parts.push("no RGB/IR pairs found".to_string());
        }
        Some(parts.join("; "))
    }
}

fn names(assets: &[&InputAsset]) -> String {
    assets
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Prefix {
    Rgb,
    Ir,
}

/// Split `name` into its modality prefix and pairing key.
fn parse_name(name: &str) -> Option<(Prefix, &str)> {
    let (prefix, rest) = name.split_once('_')?;
    let prefix = if prefix.eq_ignore_ascii_case("rgb") {
        Prefix::Rgb
    } else if prefix.eq_ignore_ascii_case("ir") {
        Prefix::Ir
    } else {
        return None;
    };
    let key = match rest.rfind('.') {
        Some(dot) => &rest[..dot],
        None => rest,
    };
    Some((prefix, key))
}

/// Insertion-ordered map with last-write-wins values.
#[derive(Default)]
struct KeyedAssets<'a> {
    order: Vec<(&'a str, &'a InputAsset)>,
    index: HashMap<&'a str, usize>,
}

impl<'a> KeyedAssets<'a> {
    /// Insert, returning the asset that was replaced.
    fn insert(&mut self, key: &'a str, asset: &'a InputAsset) -> Option<&'a InputAsset> {
        match self.index.get(key) {
            Some(&i) => Some(std::mem::replace(&mut self.order[i].1, asset)),
            None => {
                self.index.insert(key, self.order.len());
                self.order.push((key, asset));
                None
            }
        }
    }

    fn get(&self, key: &str) -> Option<&'a InputAsset> {
        self.index.get(key).map(|&i| self.order[i].1)
    }

    fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }
}

/// Partition `assets` into RGB/IR pairs plus everything that did not pair.
pub fn resolve_pairs(assets: &[InputAsset]) -> PairingReport<'_> {
    let mut report = PairingReport::default();
    let mut rgb = KeyedAssets::default();
    let mut ir = KeyedAssets::default();

    for asset in assets {
        let Some((prefix, key)) = parse_name(&asset.name) else {
            report.invalid.push(asset);
            continue;
        };
        let replaced = match prefix {
            Prefix::Rgb => rgb.insert(key, asset),
            Prefix::Ir => ir.insert(key, asset),
        };
        if let Some(old) = replaced {
            report.duplicates.push(old);
        }
    }

    for &(key, rgb_asset) in &rgb.order {
        match ir.get(key) {
            Some(ir_asset) => report.pairs.push((rgb_asset, ir_asset)),
            None => report.unpaired_rgb.push(rgb_asset),
        }
    }
    report.unpaired_ir = ir
        .order
        .iter()
        .filter(|(key, _)| !rgb.contains(key))
        .map(|&(_, a)| a)
        .collect();

    report
}
