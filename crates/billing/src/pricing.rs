//! Price classification
//!
//! Maps provider price references onto the product catalog: base-plan tiers
//! and add-on products. The mapping is loaded once at startup and treated as
//! read-only configuration during event processing. Any price reference the
//! book does not recognize classifies as [`Classification::Unknown`], which
//! downstream handlers treat as "mutate nothing" — an unrecognized price is
//! far more likely a misconfigured deployment than a new product.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Base-plan subscription tier, ordered by rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    None,
    Starter,
    Professional,
    Enterprise,
}

impl Tier {
    /// Numeric rank used for upgrade/downgrade comparison
    pub fn rank(self) -> u8 {
        match self {
            Tier::None => 0,
            Tier::Starter => 1,
            Tier::Professional => 2,
            Tier::Enterprise => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::None => "none",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "none" => Some(Tier::None),
            "starter" => Some(Tier::Starter),
            "professional" => Some(Tier::Professional),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a tier change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierChange {
    Upgrade,
    Downgrade,
    Same,
}

/// Compare two tiers by rank.
///
/// The three-way result drives the state machine's branch between
/// immediate upgrades, grace-period downgrades, and same-tier renewals.
pub fn compare_tier(current: Tier, new: Tier) -> TierChange {
    use std::cmp::Ordering;
    match new.rank().cmp(&current.rank()) {
        Ordering::Greater => TierChange::Upgrade,
        Ordering::Less => TierChange::Downgrade,
        Ordering::Equal => TierChange::Same,
    }
}

/// An add-on product as known to the price book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonProduct {
    pub name: String,
    pub category: String,
}

/// Result of classifying a provider price reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Base { tier: Tier },
    Addon { name: String, category: String },
    Unknown,
}

/// Static mapping of provider price references to product classifications
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    base: HashMap<String, Tier>,
    addons: HashMap<String, AddonProduct>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the price book from environment variables.
    ///
    /// Base tiers: `PRICE_REFS_STARTER`, `PRICE_REFS_PROFESSIONAL`,
    /// `PRICE_REFS_ENTERPRISE`, each a comma-separated list of provider
    /// price ids.
    ///
    /// Add-ons: `ADDON_PRICE_REFS`, a comma-separated list of
    /// `price_ref:addon_name:addon_category` entries.
    pub fn from_env() -> Self {
        let mut book = PriceBook::new();

        let base_vars = [
            ("PRICE_REFS_STARTER", Tier::Starter),
            ("PRICE_REFS_PROFESSIONAL", Tier::Professional),
            ("PRICE_REFS_ENTERPRISE", Tier::Enterprise),
        ];

        for (var, tier) in base_vars {
            if let Ok(refs) = std::env::var(var) {
                for price_ref in refs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    book.add_base(price_ref, tier);
                }
            }
        }

        if let Ok(entries) = std::env::var("ADDON_PRICE_REFS") {
            for entry in entries.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let parts: Vec<&str> = entry.splitn(3, ':').collect();
                if let [price_ref, name, category] = parts[..] {
                    book.add_addon(price_ref, name, category);
                } else {
                    tracing::warn!(
                        entry = %entry,
                        "Skipping malformed ADDON_PRICE_REFS entry (expected ref:name:category)"
                    );
                }
            }
        }

        tracing::info!(
            base_prices = book.base.len(),
            addon_prices = book.addons.len(),
            "Price book loaded"
        );

        book
    }

    pub fn add_base(&mut self, price_ref: &str, tier: Tier) -> &mut Self {
        self.base.insert(price_ref.to_string(), tier);
        self
    }

    pub fn add_addon(&mut self, price_ref: &str, name: &str, category: &str) -> &mut Self {
        self.addons.insert(
            price_ref.to_string(),
            AddonProduct {
                name: name.to_string(),
                category: category.to_string(),
            },
        );
        self
    }

    /// Classify a provider price reference. `Unknown` is the safe default.
    pub fn classify(&self, price_ref: &str) -> Classification {
        if let Some(&tier) = self.base.get(price_ref) {
            return Classification::Base { tier };
        }
        if let Some(addon) = self.addons.get(price_ref) {
            return Classification::Addon {
                name: addon.name.clone(),
                category: addon.category.clone(),
            };
        }
        Classification::Unknown
    }
}
