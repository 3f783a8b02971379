//! EVM log decoding against static event schemas.
//!
//! Indexed parameters live in `topics[1..]`, one 32-byte word each; the rest
//! are ABI-encoded as a parameter sequence in the log's data bytes.

use std::collections::HashMap;

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{keccak256, Address, Bytes, B256};

use crate::errors::{IndexerError, Result};
use crate::rpc::RawLog;

/// One event parameter as declared in the contract ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    /// Solidity type, e.g. `bytes32` or `uint8`.
    pub ty: &'static str,
    pub indexed: bool,
}

impl Param {
    pub const fn indexed(name: &'static str, ty: &'static str) -> Self {
        Self {
            name,
            ty,
            indexed: true,
        }
    }

    pub const fn data(name: &'static str, ty: &'static str) -> Self {
        Self {
            name,
            ty,
            indexed: false,
        }
    }
}

/// Ordered parameter list of a non-anonymous event.
#[derive(Debug)]
pub struct EventSchema {
    pub name: &'static str,
    pub params: &'static [Param],
}

impl EventSchema {
    /// Canonical signature, e.g. `ProjectRegistered(bytes32,address,string)`.
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.params.iter().map(|p| p.ty).collect();
        format!("{}({})", self.name, types.join(","))
    }

    /// Event selector carried in `topics[0]`.
    pub fn topic0(&self) -> B256 {
        keccak256(self.signature().as_bytes())
    }

    fn resolve(&self, param: &Param) -> Result<DynSolType> {
        DynSolType::parse(param.ty).map_err(|e| {
            IndexerError::malformed(self.name, format!("bad type for {}: {e}", param.name))
        })
    }
}

/// Named arguments of one decoded log.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedArgs {
    event: &'static str,
    fields: HashMap<&'static str, DynSolValue>,
}

impl DecodedArgs {
    pub fn get(&self, name: &str) -> Option<&DynSolValue> {
        self.fields.get(name)
    }

    fn field(&self, name: &str) -> Result<&DynSolValue> {
        self.get(name)
            .ok_or_else(|| IndexerError::malformed(self.event, format!("missing field {name}")))
    }

    fn mismatch(&self, name: &str, expected: &str) -> IndexerError {
        IndexerError::malformed(self.event, format!("field {name} is not {expected}"))
    }

    pub fn word(&self, name: &str) -> Result<B256> {
        match self.field(name)? {
            DynSolValue::FixedBytes(word, 32) => Ok(*word),
            _ => Err(self.mismatch(name, "bytes32")),
        }
    }

    pub fn address(&self, name: &str) -> Result<Address> {
        match self.field(name)? {
            DynSolValue::Address(addr) => Ok(*addr),
            _ => Err(self.mismatch(name, "an address")),
        }
    }

    pub fn string(&self, name: &str) -> Result<String> {
        match self.field(name)? {
            DynSolValue::String(s) => Ok(s.clone()),
            _ => Err(self.mismatch(name, "a string")),
        }
    }

    pub fn uint8(&self, name: &str) -> Result<u8> {
        match self.field(name)? {
            DynSolValue::Uint(value, _) => {
                u8::try_from(*value).map_err(|_| self.mismatch(name, "a uint8"))
            }
            _ => Err(self.mismatch(name, "a uint8")),
        }
    }

    pub fn boolean(&self, name: &str) -> Result<bool> {
        match self.field(name)? {
            DynSolValue::Bool(b) => Ok(*b),
            _ => Err(self.mismatch(name, "a bool")),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<Bytes> {
        match self.field(name)? {
            DynSolValue::Bytes(b) => Ok(Bytes::from(b.clone())),
            _ => Err(self.mismatch(name, "bytes")),
        }
    }
}

/// Decode a raw log into named arguments.
///
/// Fails with `MalformedLog` when the selector, the number of indexed topics,
/// or the data layout disagree with `schema`.
pub fn decode_log(log: &RawLog, schema: &EventSchema) -> Result<DecodedArgs> {
    let (selector, topics) = log
        .topics
        .split_first()
        .ok_or_else(|| IndexerError::malformed(schema.name, "log has no topics"))?;
    if *selector != schema.topic0() {
        return Err(IndexerError::malformed(
            schema.name,
            format!("unexpected selector {selector}"),
        ));
    }

    let (indexed, body): (Vec<&Param>, Vec<&Param>) =
        schema.params.iter().partition(|p| p.indexed);
    if topics.len() != indexed.len() {
        return Err(IndexerError::malformed(
            schema.name,
            format!("expected {} indexed topics, got {}", indexed.len(), topics.len()),
        ));
    }

    let mut fields = HashMap::with_capacity(schema.params.len());
    for (param, topic) in indexed.iter().zip(topics) {
        let ty = schema.resolve(param)?;
        let value = decode_topic(&ty, topic).map_err(|e| {
            IndexerError::malformed(schema.name, format!("topic {}: {e}", param.name))
        })?;
        fields.insert(param.name, value);
    }

    let types = body
        .iter()
        .map(|p| schema.resolve(p))
        .collect::<Result<Vec<_>>>()?;
    let values = decode_params(&log.data, &types)
        .map_err(|e| IndexerError::malformed(schema.name, format!("data: {e}")))?;
    for (param, value) in body.iter().zip(values) {
        fields.insert(param.name, value);
    }

    Ok(DecodedArgs {
        event: schema.name,
        fields,
    })
}

/// Decode an ABI-encoded parameter sequence positionally.
///
/// Used for the log data section and for payloads nested inside `bytes`
/// arguments (e.g. the minted amount carried by a verification outcome).
pub fn decode_params(
    payload: &[u8],
    types: &[DynSolType],
) -> std::result::Result<Vec<DynSolValue>, alloy_dyn_abi::Error> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    match DynSolType::Tuple(types.to_vec()).abi_decode_params(payload)? {
        DynSolValue::Tuple(values) => Ok(values),
        other => Ok(vec![other]),
    }
}

/// Indexed reference types are stored as the keccak hash of their encoding,
/// so only the raw word can be recovered.
fn decode_topic(
    ty: &DynSolType,
    topic: &B256,
) -> std::result::Result<DynSolValue, alloy_dyn_abi::Error> {
    match ty {
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(*topic, 32)),
        _ => ty.abi_decode(topic.as_slice()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256, U256};

    const TRANSFER: EventSchema = EventSchema {
        name: "Transfer",
        params: &[
            Param::indexed("from", "address"),
            Param::indexed("to", "address"),
            Param::data("value", "uint256"),
        ],
    };

    const NOTE: EventSchema = EventSchema {
        name: "Note",
        params: &[
            Param::indexed("tag", "string"),
            Param::data("flag", "bool"),
            Param::data("body", "string"),
        ],
    };

    fn log(topics: Vec<B256>, data: Vec<u8>) -> RawLog {
        RawLog {
            address: Address::ZERO,
            topics,
            data: data.into(),
            block_number: 1,
            log_index: 0,
            transaction_hash: None,
            removed: false,
        }
    }

    #[test]
    fn selector_is_keccak_of_signature() {
        assert_eq!(TRANSFER.signature(), "Transfer(address,address,uint256)");
        assert_eq!(
            TRANSFER.topic0(),
            b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
        );
    }

    #[test]
    fn decodes_indexed_and_data_fields() {
        let from = address!("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
        let to = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        let data = DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(42u64), 256)])
            .abi_encode_params();

        let args = decode_log(
            &log(vec![TRANSFER.topic0(), from.into_word(), to.into_word()], data),
            &TRANSFER,
        )
        .unwrap();

        assert_eq!(args.address("from").unwrap(), from);
        assert_eq!(args.address("to").unwrap(), to);
        assert_eq!(
            args.get("value"),
            Some(&DynSolValue::Uint(U256::from(42u64), 256))
        );
    }

    #[test]
    fn dynamic_data_fields_follow_their_offsets() {
        let tag_hash = keccak256("greeting");
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Bool(true),
            DynSolValue::String("hello".into()),
        ])
        .abi_encode_params();

        let args = decode_log(&log(vec![NOTE.topic0(), tag_hash], data), &NOTE).unwrap();
        assert_eq!(args.word("tag").unwrap(), tag_hash);
        assert!(args.boolean("flag").unwrap());
        assert_eq!(args.string("body").unwrap(), "hello");
    }

    #[test]
    fn missing_indexed_topic_is_malformed() {
        let from = address!("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
        let err = decode_log(&log(vec![TRANSFER.topic0(), from.into_word()], vec![]), &TRANSFER)
            .unwrap_err();
        assert!(matches!(err, IndexerError::MalformedLog { event: "Transfer", .. }));
    }

    #[test]
    fn truncated_data_is_malformed() {
        let data = vec![0u8; 16];
        let err = decode_log(
            &log(vec![TRANSFER.topic0(), B256::ZERO, B256::ZERO], data),
            &TRANSFER,
        )
        .unwrap_err();
        assert!(matches!(err, IndexerError::MalformedLog { .. }));
    }

    #[test]
    fn log_without_topics_is_malformed() {
        let err = decode_log(&log(vec![], vec![]), &TRANSFER).unwrap_err();
        assert!(err.to_string().contains("no topics"));
    }

    #[test]
    fn typed_accessor_rejects_wrong_type() {
        let data = DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(300u64), 256)])
            .abi_encode_params();
        let args = decode_log(
            &log(vec![TRANSFER.topic0(), B256::ZERO, B256::ZERO], data),
            &TRANSFER,
        )
        .unwrap();
        assert!(args.string("value").is_err());
        assert!(args.uint8("value").is_err());
        assert!(args.word("nope").is_err());
    }

    #[test]
    fn decode_params_extracts_nested_amount() {
        let payload = DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(1000u64), 256)])
            .abi_encode_params();
        let values = decode_params(&payload, &[DynSolType::Uint(256)]).unwrap();
        assert_eq!(values, vec![DynSolValue::Uint(U256::from(1000u64), 256)]);
    }

    #[test]
    fn decode_params_rejects_short_payload() {
        assert!(decode_params(&[0u8; 8], &[DynSolType::Uint(256)]).is_err());
    }
}
