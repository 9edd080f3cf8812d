// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! The producer marshals every payload through a pluggable [`Serializer`]
//! whose [`name`](Serializer::name) doubles as the published content type.
//! JSON is the default.

use serde_json::Value;

use crate::errors::RabbidsError;

pub trait Serializer: Send + Sync {
    /// Content type stamped on published messages.
    fn name(&self) -> &'static str;

    fn marshal(&self, data: &Value) -> Result<Vec<u8>, RabbidsError>;
}

/// The default serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Json;

impl Serializer for Json {
    fn name(&self) -> &'static str {
        "application/json"
    }

    fn marshal(&self, data: &Value) -> Result<Vec<u8>, RabbidsError> {
        Ok(serde_json::to_vec(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_marshals_with_its_content_type() {
        let serializer = Json;

        assert_eq!(serializer.name(), "application/json");
        assert_eq!(
            serializer.marshal(&json!({"fooo": "bazzz"})).unwrap(),
            br#"{"fooo":"bazzz"}"#
        );
    }
}
