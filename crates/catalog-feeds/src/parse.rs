use std::collections::BTreeMap;

use catalog_core::{CurrentPrice, ItemId, RawCurrentPriceRow, RawHistoryRow, RawItemRecord};
use serde::de::DeserializeOwned;

use crate::ItemPage;

fn reader(body: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes())
}

/// Rows that fail to decode are logged and dropped.
fn lenient_rows<T: DeserializeOwned>(body: &str, feed: &str) -> Vec<T> {
    let mut rows = Vec::new();
    for (idx, row) in reader(body).deserialize::<T>().enumerate() {
        match row {
            Ok(row) => rows.push(row),
            Err(err) => tracing::warn!(feed, row = idx + 1, error = %err, "skipping malformed row"),
        }
    }
    rows
}

/// Parse one item page. A malformed page is an error and ends pagination.
pub fn parse_item_page(body: &str) -> Result<ItemPage, csv::Error> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(ItemPage::Empty);
    }
    let rows = reader(body)
        .deserialize::<RawItemRecord>()
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        Ok(ItemPage::HeaderOnly)
    } else {
        Ok(ItemPage::Rows(rows))
    }
}

pub fn parse_history(body: &str) -> Vec<RawHistoryRow> {
    let body = body.trim();
    if body.is_empty() {
        return Vec::new();
    }
    lenient_rows(body, "history")
}

/// Index the current-price feed by item id. Rows without an id, a numeric
/// price or a timestamp are dropped; duplicate ids keep the newest row.
pub fn parse_current_prices(body: &str) -> BTreeMap<ItemId, CurrentPrice> {
    let mut prices: BTreeMap<ItemId, CurrentPrice> = BTreeMap::new();
    for row in lenient_rows::<RawCurrentPriceRow>(body.trim(), "current_prices") {
        let Some(price) = row.into_current_price() else {
            continue;
        };
        match prices.get(&price.item_id) {
            Some(existing) if existing.date_updated >= price.date_updated => {}
            _ => {
                prices.insert(price.item_id.clone(), price);
            }
        }
    }
    prices
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM_HEADER: &str =
        "id,name,category_name,group_name,weekly_average_price,icon_id,date_created,date_updated";

    #[test]
    fn empty_and_header_only_pages_are_distinguished() {
        assert_eq!(parse_item_page("").expect("empty"), ItemPage::Empty);
        assert_eq!(parse_item_page("  \n \n").expect("blank"), ItemPage::Empty);
        assert_eq!(
            parse_item_page(&format!("{ITEM_HEADER}\n")).expect("header"),
            ItemPage::HeaderOnly
        );
    }

    #[test]
    fn item_rows_map_by_header_name() {
        let body = format!(
            "{ITEM_HEADER},icon_url\n1,Sword,Weapon,Blades,10.5,77,2023-01-01T00:00:00+00:00,2024-01-01T00:00:00+00:00,http://x\n"
        );
        let page = parse_item_page(&body).expect("page");
        let rows = page.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_id(), Some("1"));
        assert_eq!(rows[0].name.as_deref(), Some("Sword"));
        assert_eq!(rows[0].weekly_average_price.as_deref(), Some("10.5"));
        assert_eq!(rows[0].date_updated(), Some("2024-01-01T00:00:00+00:00"));
    }

    #[test]
    fn short_item_rows_leave_missing_columns_empty() {
        let body = format!("{ITEM_HEADER}\n2,Shield\n");
        let page = parse_item_page(&body).expect("page");
        assert_eq!(page.rows()[0].item_id(), Some("2"));
        assert_eq!(page.rows()[0].date_updated(), None);
    }

    #[test]
    fn history_without_rows_is_empty() {
        assert!(parse_history("").is_empty());
        assert!(parse_history("price,week,year,date_created,date_updated\n").is_empty());
    }

    #[test]
    fn current_prices_keep_newest_row_per_id() {
        let body = "id,estimated_price,date_updated\n\
            1,13.0,2024-01-03T00:00:00+00:00\n\
            1,12.0,2024-01-02T00:00:00+00:00\n\
            2,,2024-01-03T00:00:00+00:00\n\
            ,5,2024-01-03T00:00:00+00:00\n";
        let prices = parse_current_prices(body);
        assert_eq!(prices.len(), 1);
        assert_eq!(prices["1"].date_updated, "2024-01-03T00:00:00+00:00");
        assert_eq!(prices["1"].estimated_price.to_string(), "13.0");
    }
}
