use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Size-keyed counters, e.g. `{"M": 12, "L": 4}`.
pub type SizeMap = BTreeMap<String, i32>;

/// Stock held by one supplier for one product, broken down by size.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub supplier_id: Uuid,
    pub product_id: Uuid,
    #[sea_orm(column_type = "Json")]
    pub stock: Json,
    #[sea_orm(column_type = "Json")]
    pub low_stock_thresholds: Json,
    /// Sum of `stock`, recomputed on every write.
    pub total_stock: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn stock_map(&self) -> SizeMap {
        decode_size_map(&self.stock)
    }

    pub fn threshold_map(&self) -> SizeMap {
        decode_size_map(&self.low_stock_thresholds)
    }
}

/// Reads a persisted size map, dropping entries that are not integers.
pub fn decode_size_map(value: &Json) -> SizeMap {
    value
        .as_object()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(size, qty)| {
                    let q = i32::try_from(qty.as_i64()?).ok()?;
                    Some((size.clone(), q))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn encode_size_map(map: &SizeMap) -> Json {
    serde_json::to_value(map).unwrap_or_else(|_| Json::Object(Default::default()))
}

/// Saturates at `i32::MAX` rather than wrapping.
pub fn total_of(map: &SizeMap) -> i32 {
    map.values()
        .fold(0i32, |acc, q| acc.saturating_add((*q).max(0)))
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_maps_survive_json_encoding() {
        let mut map = SizeMap::new();
        map.insert("M".into(), 12);
        map.insert("XL".into(), 0);

        let decoded = decode_size_map(&encode_size_map(&map));
        assert_eq!(decoded, map);
        assert_eq!(total_of(&decoded), 12);
    }

    #[test]
    fn malformed_entries_are_ignored() {
        let value = serde_json::json!({"S": 3, "M": "lots"});
        let decoded = decode_size_map(&value);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get("S"), Some(&3));

        let huge = serde_json::json!({"S": 3, "M": i64::from(i32::MAX) + 1});
        assert_eq!(decode_size_map(&huge).len(), 1);
    }

    #[test]
    fn totals_saturate_instead_of_overflowing() {
        let mut map = SizeMap::new();
        map.insert("M".into(), i32::MAX);
        map.insert("L".into(), 1);
        map.insert("S".into(), -4);
        assert_eq!(total_of(&map), i32::MAX);
    }
}
