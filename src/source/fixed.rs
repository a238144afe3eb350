use async_trait::async_trait;

use crate::error::FetchError;
use crate::source::PriceSource;
use crate::types::Asset;

/// Constant price. Cash is worth one unit of itself.
pub struct Fixed {
    price: f64,
}

impl Fixed {
    pub fn unit() -> Self {
        Self { price: 1.0 }
    }
}

#[async_trait]
impl PriceSource for Fixed {
    fn id(&self) -> &str {
        "fixed"
    }

    async fn fetch_price(&self, _asset: &Asset) -> Result<f64, FetchError> {
        Ok(self.price)
    }

    async fn fetch_history(&self, _asset: &Asset, days: u32) -> Result<Vec<f64>, FetchError> {
        Ok(vec![self.price; days.max(1) as usize])
    }
}
