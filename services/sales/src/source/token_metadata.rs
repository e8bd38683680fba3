//! Token metadata account addressing and decoding.
//!
//! NFT name, symbol and metadata URI live in a program-derived account of the
//! token metadata program. The account is borsh encoded; strings are padded
//! with NUL bytes to a fixed width.

use super::SourceError;
use crate::record::NftInfo;
use borsh::BorshDeserialize;
use solana_program::pubkey::Pubkey;
use std::str::FromStr;

pub const TOKEN_METADATA_PROGRAM_ID: &str = "metaqbxxUerdq28cj1RbAWkYQm3ybzjb6a8bt518x1s";

const METADATA_SEED: &[u8] = b"metadata";

/// Leading fields of a metadata account; creators and the rest follow.
#[derive(BorshDeserialize)]
struct MetadataHeader {
    _key: u8,
    _update_authority: [u8; 32],
    _mint: [u8; 32],
    name: String,
    symbol: String,
    uri: String,
}

fn strip_padding(value: &str) -> String {
    value.replace('\0', "")
}

/// Parse a base58 account address.
pub fn parse_pubkey(address: &str) -> Result<Pubkey, SourceError> {
    Pubkey::from_str(address)
        .map_err(|e| SourceError::Malformed(format!("invalid address {address}: {e}")))
}

/// Address of the metadata account for an NFT mint.
pub fn metadata_address(mint: &str) -> Result<String, SourceError> {
    let program_id = parse_pubkey(TOKEN_METADATA_PROGRAM_ID)?;
    let mint_key = parse_pubkey(mint)?;

    let (address, _bump) = Pubkey::try_find_program_address(
        &[METADATA_SEED, program_id.as_ref(), mint_key.as_ref()],
        &program_id,
    )
    .ok_or_else(|| SourceError::Malformed(format!("no metadata address for mint {mint}")))?;

    Ok(address.to_string())
}

/// Decode name, symbol and URI from a metadata account's data.
pub fn decode_metadata(data: &[u8]) -> Result<NftInfo, SourceError> {
    let mut reader = data;
    let header = MetadataHeader::deserialize(&mut reader)
        .map_err(|e| SourceError::Malformed(format!("metadata account: {e}")))?;

    Ok(NftInfo {
        name: strip_padding(&header.name),
        symbol: strip_padding(&header.symbol),
        metadata_uri: strip_padding(&header.uri),
    })
}
