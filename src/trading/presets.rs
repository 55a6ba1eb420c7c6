//! Ranked catalog of predefined take-profit strategies.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{StrategyConfig, Tier};

/// Id of the strategy used when none is configured.
pub const DEFAULT_PRESET: &str = "trailing_15";

/// A named, ranked strategy.
#[derive(Debug, Clone)]
pub struct StrategyPreset {
    pub id: &'static str,
    pub name: &'static str,
    /// 1 = best historical performer
    pub rank: u32,
    pub config: StrategyConfig,
}

fn trailing(stop_pct: Decimal) -> StrategyConfig {
    StrategyConfig::Trailing { stop_pct }
}

fn fixed(target: Decimal) -> StrategyConfig {
    StrategyConfig::Fixed {
        target_multiplier: target,
        stop_loss_multiplier: Some(dec!(0.5)),
    }
}

fn tiered(tiers: &[(Decimal, Decimal)]) -> StrategyConfig {
    StrategyConfig::Tiered {
        tiers: tiers.iter().map(|&(m, pct)| Tier::new(m, pct)).collect(),
    }
}

/// All presets in rank order.
pub fn all() -> Vec<StrategyPreset> {
    let entries: Vec<(&'static str, &'static str, StrategyConfig)> = vec![
        ("trailing_15", "Trailing Stop (15%)", trailing(dec!(0.15))),
        ("trailing_20", "Trailing Stop (20%)", trailing(dec!(0.20))),
        ("trailing_25", "Trailing Stop (25%)", trailing(dec!(0.25))),
        ("trailing_30", "Trailing Stop (30%)", trailing(dec!(0.30))),
        ("fixed_5x", "Fixed Exit 5.0X", fixed(dec!(5.0))),
        ("fixed_4x", "Fixed Exit 4.0X", fixed(dec!(4.0))),
        (
            "tiered_2_3_5",
            "Tiered 2.0X(33%)+3.0X(33%)+5.0X(34%)",
            tiered(&[(dec!(2.0), dec!(33)), (dec!(3.0), dec!(33)), (dec!(5.0), dec!(34))]),
        ),
        ("fixed_3x", "Fixed Exit 3.0X", fixed(dec!(3.0))),
        (
            "tiered_2_3",
            "Tiered 2.0X(50%)+3.0X(50%)",
            tiered(&[(dec!(2.0), dec!(50)), (dec!(3.0), dec!(50))]),
        ),
        ("fixed_2_5x", "Fixed Exit 2.5X", fixed(dec!(2.5))),
        ("fixed_2x", "Fixed Exit 2.0X", fixed(dec!(2.0))),
        (
            "tiered_1_5_2_5",
            "Tiered 1.5X(50%)+2.5X(50%)",
            tiered(&[(dec!(1.5), dec!(50)), (dec!(2.5), dec!(50))]),
        ),
        ("fixed_1_5x", "Fixed Exit 1.5X", fixed(dec!(1.5))),
    ];

    entries
        .into_iter()
        .enumerate()
        .map(|(i, (id, name, config))| StrategyPreset {
            id,
            name,
            rank: i as u32 + 1,
            config,
        })
        .collect()
}

/// Look up a preset by id (case-insensitive).
pub fn by_id(id: &str) -> Option<StrategyPreset> {
    let id = id.trim().to_lowercase();
    all().into_iter().find(|p| p.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_valid_and_ranked() {
        let presets = all();
        assert_eq!(presets.len(), 13);
        for (i, preset) in presets.iter().enumerate() {
            assert_eq!(preset.rank, i as u32 + 1);
            preset.config.validate().unwrap();
        }
        assert_eq!(presets[0].id, DEFAULT_PRESET);
    }

    #[test]
    fn test_lookup() {
        let preset = by_id("Tiered_2_3_5").unwrap();
        match preset.config {
            StrategyConfig::Tiered { tiers } => assert_eq!(tiers.len(), 3),
            other => panic!("unexpected config: {:?}", other),
        }
        assert!(by_id("moon_mission").is_none());
    }
}
