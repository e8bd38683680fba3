//! Known marketplaces and the static tables used to recognise their sales.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Marketplaces whose sales are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Marketplace {
    MagicEden,
    AlphaArt,
    Solsea,
    Solanart,
    DigitalEyes,
    ExchangeArt,
}

/// Program address → marketplace. A transaction is a marketplace sale when
/// any of its account keys appears here.
pub const PROGRAM_ADDRESSES: &[(&str, Marketplace)] = &[
    ("MEisE1HzehtrDpAAT8PnLHjpSSkRYakotTuJRPjTpo8", Marketplace::MagicEden),
    ("HZaWndaNWHFDd9Dhk5pqUUtsmoBCqzb1MLu3NAh1VX6B", Marketplace::AlphaArt),
    ("617jbWo616ggkDxvW1Le8pV38XLbVSyWY8ae6QUmGBAU", Marketplace::Solsea),
    ("CJsLwbP1iu5DuUikHEJnLfANgKy6stB2uFgvBBHoyxwz", Marketplace::Solanart),
    ("A7p8451ktDCHq5yYaHczeLMYsjRsAkzc3hCXcSrwYHU7", Marketplace::DigitalEyes),
    ("AmK5g2XcyptVLCFESBCJqoSfwV3znGoVYQnqEnaAZKWn", Marketplace::ExchangeArt),
];

impl Marketplace {
    /// Human readable name used in published messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Marketplace::MagicEden => "Magic Eden",
            Marketplace::AlphaArt => "Alpha Art",
            Marketplace::Solsea => "Solsea",
            Marketplace::Solanart => "Solanart",
            Marketplace::DigitalEyes => "Digital Eyes",
            Marketplace::ExchangeArt => "Exchange Art",
        }
    }

    /// Find the marketplace program among a transaction's account keys.
    pub fn classify<S: AsRef<str>>(account_keys: &[S]) -> Option<Marketplace> {
        account_keys.iter().find_map(|key| {
            PROGRAM_ADDRESSES
                .iter()
                .find(|(address, _)| *address == key.as_ref())
                .map(|(_, marketplace)| *marketplace)
        })
    }

    /// Map the marketplace label reported by the Alpha Art activity feed.
    pub fn from_feed_label(label: &str) -> Option<Marketplace> {
        match label.to_ascii_lowercase().as_str() {
            "alpha.art" | "alpha-art" | "alphaart" => Some(Marketplace::AlphaArt),
            "magiceden" | "magic-eden" | "magic eden" => Some(Marketplace::MagicEden),
            "solsea" => Some(Marketplace::Solsea),
            "solanart" => Some(Marketplace::Solanart),
            "digitaleyes" | "digital-eyes" | "digital eyes" => Some(Marketplace::DigitalEyes),
            "exchange.art" | "exchange-art" => Some(Marketplace::ExchangeArt),
            _ => None,
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Per-marketplace minimum prices below which an entry is not a real sale.
///
/// Some marketplace programs also appear in listing and offer transactions
/// whose balance delta is only fees; those are dropped here.
#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    min_price: HashMap<Marketplace, u64>,
}

impl NoiseFilter {
    pub fn new(min_price: HashMap<Marketplace, u64>) -> Self {
        Self { min_price }
    }

    pub fn is_noise(&self, marketplace: Marketplace, price: u64) -> bool {
        self.min_price
            .get(&marketplace)
            .map(|min| price < *min)
            .unwrap_or(false)
    }
}

/// Buyer and seller identified from a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parties {
    pub buyer: Option<String>,
    pub seller: Option<String>,
}

/// Identify buyer and seller from account keys and lamport balances.
///
/// `pre_balances` and `post_balances` are index-aligned with `account_keys`.
pub fn identify_parties(
    marketplace: Marketplace,
    account_keys: &[String],
    pre_balances: &[u64],
    post_balances: &[u64],
) -> Parties {
    Parties {
        buyer: find_buyer(marketplace, account_keys, pre_balances, post_balances),
        seller: find_seller(marketplace, account_keys, pre_balances, post_balances),
    }
}

fn find_buyer(
    marketplace: Marketplace,
    account_keys: &[String],
    pre_balances: &[u64],
    post_balances: &[u64],
) -> Option<String> {
    match marketplace {
        // fee payer signs the purchase
        Marketplace::MagicEden | Marketplace::DigitalEyes | Marketplace::AlphaArt => {
            account_keys.first().cloned()
        }
        Marketplace::Solsea => pre_balances
            .iter()
            .zip(post_balances)
            .position(|(pre, post)| *pre == 0 && *post == 0)
            .and_then(|i| account_keys.get(i).cloned()),
        Marketplace::Solanart | Marketplace::ExchangeArt => None,
    }
}

fn find_seller(
    marketplace: Marketplace,
    account_keys: &[String],
    pre_balances: &[u64],
    post_balances: &[u64],
) -> Option<String> {
    if marketplace == Marketplace::Solsea {
        return account_keys.first().cloned();
    }

    let (first_pre, first_post) = (*pre_balances.first()?, *post_balances.first()?);
    if first_pre < first_post {
        return None;
    }

    // the seller receives roughly what the buyer spent, minus fees and royalties
    let spent = first_pre - first_post;
    let tolerance = (spent / 100) * 20;

    pre_balances
        .iter()
        .zip(post_balances)
        .enumerate()
        .filter(|(_, (pre, post))| post >= pre)
        .find_map(|(i, (pre, post))| {
            let gained = post - pre;
            let diff = spent.checked_sub(gained)?;
            if diff <= tolerance {
                account_keys.get(i).cloned()
            } else {
                None
            }
        })
}
