use crate::models::StockRecord;
use std::collections::BTreeMap;

/// Whether `challenger` should displace `current` for the same symbol.
/// EQ series first, then completeness; ties keep the incumbent.
pub fn prefers(current: &StockRecord, challenger: &StockRecord) -> bool {
    match (current.is_equity_series(), challenger.is_equity_series()) {
        (false, true) => true,
        (true, false) => false,
        _ => challenger.completeness() > current.completeness(),
    }
}

/// Merge records across categories by uppercased symbol. Output is sorted by symbol.
pub fn dedup<I>(records: I) -> Vec<StockRecord>
where
    I: IntoIterator<Item = StockRecord>,
{
    let mut merged: BTreeMap<String, StockRecord> = BTreeMap::new();
    for mut record in records {
        record.symbol = record.symbol.to_uppercase();
        match merged.get(&record.symbol) {
            Some(current) if !prefers(current, &record) => {}
            _ => {
                merged.insert(record.symbol.clone(), record);
            }
        }
    }
    merged.into_values().collect()
}
