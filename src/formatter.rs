//! Conversion between domain messages and their wire representations.
//!
//! A [`Formatter`] is a pair of functions, [`format`] and [`revert`], which must be inverse of one
//! another. Formatters compose with [`FormatterExt::then`]: chaining `a: X -> Y` with
//! `b: Y -> Z` gives a formatter `X -> Z` which formats with `b ∘ a` and reverts with `a ∘ b`.
//! Composition is associative, so `a.then(b).then(c)` and `a.then(b.then(c))` behave the same.
//!
//! ```rust
//! use durable_mq::formatter::{Formatter, FormatterExt, Json, Utf8};
//!
//! let formatter = Json::<Vec<u32>>::new().then(Utf8);
//! let bytes = formatter.format(&vec![1, 2, 3]).unwrap();
//! assert_eq!(bytes, b"[1,2,3]");
//! assert_eq!(formatter.revert(&bytes).unwrap(), vec![1, 2, 3]);
//! ```
//!
//! [`format`]: Formatter::format
//! [`revert`]: Formatter::revert

use crate::error::ConversionError;

pub trait Formatter<In, Out>: Send + Sync {
    fn format(&self, input: &In) -> Result<Out, ConversionError>;
    fn revert(&self, output: &Out) -> Result<In, ConversionError>;
}

pub trait FormatterExt<In, Out>: Formatter<In, Out> + Sized {
    /// Chains `next` after `self`.
    fn then<Next, F>(self, next: F) -> Chain<Self, F, Out>
    where
        F: Formatter<Out, Next>,
    {
        Chain { first: self, second: next, _mid: std::marker::PhantomData }
    }
}

impl<In, Out, T: Formatter<In, Out>> FormatterExt<In, Out> for T {}

/// Two formatters run one after the other, see [`FormatterExt::then`].
pub struct Chain<A, B, Mid> {
    first: A,
    second: B,
    _mid: std::marker::PhantomData<fn() -> Mid>,
}

impl<In, Mid, Out, A, B> Formatter<In, Out> for Chain<A, B, Mid>
where
    A: Formatter<In, Mid>,
    B: Formatter<Mid, Out>,
{
    fn format(&self, input: &In) -> Result<Out, ConversionError> {
        self.second.format(&self.first.format(input)?)
    }

    fn revert(&self, output: &Out) -> Result<In, ConversionError> {
        self.first.revert(&self.second.revert(output)?)
    }
}

impl<In, Out, T: Formatter<In, Out> + ?Sized> Formatter<In, Out> for std::sync::Arc<T> {
    fn format(&self, input: &In) -> Result<Out, ConversionError> {
        (**self).format(input)
    }

    fn revert(&self, output: &Out) -> Result<In, ConversionError> {
        (**self).revert(output)
    }
}

/// Leaves values untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl<T: Clone> Formatter<T, T> for Identity {
    fn format(&self, input: &T) -> Result<T, ConversionError> {
        Ok(input.clone())
    }

    fn revert(&self, output: &T) -> Result<T, ConversionError> {
        Ok(output.clone())
    }
}

/// Serializes values to json text. A `null` document is rejected on revert: a message which
/// decodes to nothing is an error, not an empty message.
pub struct Json<T>(std::marker::PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Formatter<T, String> for Json<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    fn format(&self, input: &T) -> Result<String, ConversionError> {
        Ok(serde_json::to_string(input)?)
    }

    fn revert(&self, output: &String) -> Result<T, ConversionError> {
        let value: serde_json::Value = serde_json::from_str(output)?;
        if value.is_null() {
            return Err(ConversionError::Empty { stage: "json" });
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Encodes text as utf-8 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8;

impl Formatter<String, Vec<u8>> for Utf8 {
    fn format(&self, input: &String) -> Result<Vec<u8>, ConversionError> {
        Ok(input.as_bytes().to_vec())
    }

    fn revert(&self, output: &Vec<u8>) -> Result<String, ConversionError> {
        Ok(String::from_utf8(output.clone())?)
    }
}

/// Compresses bytes with zstd.
#[cfg(feature = "disk")]
#[derive(Clone, Copy, Debug)]
pub struct Zstd {
    level: i32,
}

#[cfg(feature = "disk")]
impl Default for Zstd {
    fn default() -> Self {
        Self { level: zstd::DEFAULT_COMPRESSION_LEVEL }
    }
}

#[cfg(feature = "disk")]
impl Zstd {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "disk")]
impl Formatter<Vec<u8>, Vec<u8>> for Zstd {
    fn format(&self, input: &Vec<u8>) -> Result<Vec<u8>, ConversionError> {
        zstd::encode_all(input.as_slice(), self.level).map_err(ConversionError::Compression)
    }

    fn revert(&self, output: &Vec<u8>) -> Result<Vec<u8>, ConversionError> {
        zstd::decode_all(output.as_slice()).map_err(ConversionError::Compression)
    }
}

/// A formatter built from a pair of closures.
pub struct FnFormatter<F, R> {
    format: F,
    revert: R,
}

/// Builds a [`Formatter`] from a `format` and a `revert` closure.
pub fn formatter_fn<In, Out, F, R>(format: F, revert: R) -> FnFormatter<F, R>
where
    F: Fn(&In) -> Result<Out, ConversionError> + Send + Sync,
    R: Fn(&Out) -> Result<In, ConversionError> + Send + Sync,
{
    FnFormatter { format, revert }
}

impl<In, Out, F, R> Formatter<In, Out> for FnFormatter<F, R>
where
    F: Fn(&In) -> Result<Out, ConversionError> + Send + Sync,
    R: Fn(&Out) -> Result<In, ConversionError> + Send + Sync,
{
    fn format(&self, input: &In) -> Result<Out, ConversionError> {
        (self.format)(input)
    }

    fn revert(&self, output: &Out) -> Result<In, ConversionError> {
        (self.revert)(output)
    }
}

pub type JsonBytes<T> = Chain<Json<T>, Utf8, String>;

/// Json text encoded as utf-8 bytes. This is the body format durable queues use by default.
pub fn json_bytes<T>() -> JsonBytes<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    Json::new().then(Utf8)
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Order {
        id: u64,
        item: String,
    }

    fn order() -> Order {
        Order { id: 7, item: "keyboard".to_string() }
    }

    fn shout() -> impl Formatter<String, String> {
        formatter_fn(
            |s: &String| Ok(s.to_uppercase()),
            |s: &String| Ok(s.to_lowercase()),
        )
    }

    #[test]
    fn json_bytes_round_trip() {
        let formatter = json_bytes::<Order>();
        let bytes = formatter.format(&order()).unwrap();
        assert_eq!(formatter.revert(&bytes).unwrap(), order());
    }

    #[test]
    fn json_rejects_null() {
        let formatter = Json::<Option<u32>>::new();
        assert_matches::assert_matches!(
            formatter.revert(&"null".to_string()),
            Err(ConversionError::Empty { stage: "json" })
        );
        assert_eq!(formatter.revert(&"3".to_string()).unwrap(), Some(3));
    }

    #[test]
    fn json_reports_type_mismatch() {
        let formatter = Json::<Order>::new();
        assert_matches::assert_matches!(formatter.revert(&r#"{"id":"nope"}"#.to_string()), Err(ConversionError::Json(_)));
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        assert_matches::assert_matches!(Utf8.revert(&vec![0xff, 0xfe]), Err(ConversionError::Utf8(_)));
    }

    #[test]
    fn chain_applies_stages_in_order() {
        // format: json then uppercase, revert: lowercase then json
        let formatter = Json::<String>::new().then(shout());
        let wire = formatter.format(&"abc".to_string()).unwrap();
        assert_eq!(wire, r#""ABC""#);
        assert_eq!(formatter.revert(&wire).unwrap(), "abc");
    }

    #[test]
    fn chain_is_associative() {
        let left = Json::<Order>::new().then(Utf8).then(Identity);
        let right = Json::<Order>::new().then(Utf8.then(Identity));

        let l = left.format(&order()).unwrap();
        let r = right.format(&order()).unwrap();
        assert_eq!(l, r);
        assert_eq!(left.revert(&r).unwrap(), right.revert(&l).unwrap());
    }

    #[cfg(feature = "disk")]
    #[test]
    fn compressed_chain_round_trip() {
        let formatter = json_bytes::<Vec<Order>>().then(Zstd::default());
        let orders = vec![order(); 64];

        let wire = formatter.format(&orders).unwrap();
        assert!(wire.len() < serde_json::to_vec(&orders).unwrap().len());
        assert_eq!(formatter.revert(&wire).unwrap(), orders);
    }

    #[cfg(feature = "disk")]
    #[test]
    fn zstd_rejects_garbage() {
        assert_matches::assert_matches!(
            Zstd::with_level(1).revert(&b"definitely not zstd".to_vec()),
            Err(ConversionError::Compression(_))
        );
    }

    #[test]
    fn errors_propagate_through_chains() {
        let failing = formatter_fn(
            |_: &String| Err::<String, _>(ConversionError::Custom("refused".to_string())),
            |s: &String| Ok(s.clone()),
        );
        let formatter = Json::<u32>::new().then(failing);
        assert_matches::assert_matches!(formatter.format(&1), Err(ConversionError::Custom(msg)) => {
            assert_eq!(msg, "refused")
        });
    }
}
