use sha1::{Digest, Sha1};

use crate::contexts::{Context, Kind, Reference};
use crate::error::EvalError;
use crate::AttributeValue;

// The largest value of 15 hex digits. Converting it to f64 rounds it up to 2^60, and every SDK
// divides by that same rounded value.
const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f64 = BUCKET_SCALE_INT as f64;

/// The part of the hash input that precedes the bucketed attribute value.
#[derive(Clone, Copy, Debug)]
pub(crate) enum BucketPrefix<'a> {
    /// "<flag or segment key>.<salt>"
    KeyAndSalt(&'a str, &'a str),
    /// The rollout's seed, as a decimal string.
    Seed(i64),
}

impl<'a> BucketPrefix<'a> {
    /// The full SHA-1 input for a bucketable attribute value.
    fn hash_input(&self, id: &str) -> String {
        match self {
            BucketPrefix::KeyAndSalt(key, salt) => format!("{}.{}.{}", key, salt, id),
            BucketPrefix::Seed(seed) => format!("{}.{}", seed, id),
        }
    }
}

impl Context {
    /// Computes the context's bucket in [0, 1) for a rollout or weighted segment rule.
    ///
    /// The second value reports whether the context contains the requested kind at all. A context
    /// without that kind, or whose attribute is missing or not bucketable, lands in bucket 0.
    /// Experiments always bucket by key.
    pub(crate) fn bucket(
        &self,
        by_attr: Option<&Reference>,
        prefix: BucketPrefix,
        is_experiment: bool,
        kind: &Kind,
    ) -> Result<(f64, bool), EvalError> {
        let key_reference;
        let reference = match (is_experiment, by_attr) {
            (false, Some(reference)) => reference,
            _ => {
                key_reference = Reference::new("key");
                &key_reference
            }
        };

        if let Some(e) = reference.error() {
            return Err(EvalError::InvalidAttributeReference {
                reference: reference.to_string(),
                reason: e.to_string(),
            });
        }

        match self.as_kind(kind) {
            Some(context) => {
                let bucket = context
                    .get_value(reference)
                    .and_then(|value| bucket_value(&value, prefix))
                    .unwrap_or(0.0);
                Ok((bucket, true))
            }
            None => Ok((0.0, false)),
        }
    }
}

fn bucket_value(value: &AttributeValue, prefix: BucketPrefix) -> Option<f64> {
    let id = value.as_bucketable()?;

    let mut hash = Sha1::new();
    hash.update(prefix.hash_input(&id).as_bytes());
    let hexhash = base16ct::lower::encode_string(&hash.finalize());

    // 15 hex digits, not 16, so the value always fits in an i64
    scale_hash_prefix(&hexhash[..15])
}

fn scale_hash_prefix(hex_prefix: &str) -> Option<f64> {
    let numhash = i64::from_str_radix(hex_prefix, 16).ok()?;
    Some(numhash as f64 / BUCKET_SCALE)
}
