//! Supported networks
//!
//! A coin is parsed once from its symbol and then threaded through every
//! call as a typed value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DiscoveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coin {
    #[serde(rename = "eth")]
    Ethereum,
    #[serde(rename = "etc")]
    EthereumClassic,
    #[serde(rename = "trop")]
    Ropsten,
}

impl Coin {
    pub const ALL: [Coin; 3] = [Coin::Ethereum, Coin::EthereumClassic, Coin::Ropsten];

    /// Symbol used in configuration and routing
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Ethereum => "eth",
            Self::EthereumClassic => "etc",
            Self::Ropsten => "trop",
        }
    }

    /// Currency shortcut used for balances and pending transactions
    pub fn shortcut(&self) -> &'static str {
        match self {
            Self::Ethereum => "ETH",
            Self::EthereumClassic => "ETC",
            Self::Ropsten => "tROP",
        }
    }

    /// BIP44 account base path; addresses are its non-hardened children
    pub fn bip44_path(&self) -> &'static str {
        match self {
            Self::Ethereum => "m/44'/60'/0'/0",
            Self::EthereumClassic => "m/44'/61'/0'/0",
            Self::Ropsten => "m/44'/1'/0'/0",
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Coin {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let symbol = s.trim().to_lowercase();
        Coin::ALL
            .into_iter()
            .find(|coin| coin.symbol() == symbol)
            .ok_or_else(|| DiscoveryError::UnknownCoin(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols() {
        assert_eq!("eth".parse::<Coin>().unwrap(), Coin::Ethereum);
        assert_eq!(" ETC ".parse::<Coin>().unwrap(), Coin::EthereumClassic);
        assert!(matches!(
            "btc".parse::<Coin>(),
            Err(DiscoveryError::UnknownCoin(_))
        ));
    }

    #[test]
    fn test_serde_uses_symbol() {
        let json = serde_json::to_string(&Coin::Ropsten).unwrap();
        assert_eq!(json, "\"trop\"");
    }
}
