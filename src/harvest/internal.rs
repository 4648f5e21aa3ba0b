use chrono::Utc;

use crate::catalog::{CatalogStore, Condition, PriceObservation, ProductFilters, ProductSort};
use crate::error::StoreResult;

/// Observations for the in-house store: every inventory line linked to a
/// printing with a positive price, paired with the line's name.
pub async fn product_observations(
    store: &dyn CatalogStore,
    source_id: i16,
    page_size: i64,
) -> StoreResult<Vec<(PriceObservation, String)>> {
    let now = Utc::now();
    let mut out = Vec::new();
    let mut filters = ProductFilters {
        linked_only: true,
        sort: ProductSort::Name,
        limit: page_size.max(1),
        offset: 0,
        ..ProductFilters::default()
    };
    loop {
        let page = store.list_products(&filters).await?;
        let fetched = page.items.len() as i64;
        for product in page.items {
            let Some(printing_id) = product.printing_id.clone() else {
                continue;
            };
            if product.price <= 0.0 {
                continue;
            }
            out.push((
                PriceObservation {
                    printing_id,
                    source_id,
                    condition: Condition::NearMint,
                    price_usd: Some(product.price),
                    price_eur: None,
                    stock_quantity: Some(product.stock),
                    is_foil: false,
                    observed_at: now,
                    url: None,
                    variant: None,
                },
                product.name,
            ));
        }
        if fetched < filters.limit {
            break;
        }
        filters.offset += fetched;
    }
    Ok(out)
}
