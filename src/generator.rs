//! Product acquisition
//!
//! A [`Generator`] produces opaque artifact bytes and a descriptive metadata
//! record; [`land`] places both in the landing zone with status GENERATED.
//! [`SyntheticGenerator`] simulates a multispectral instrument.

use rand::Rng;
use serde_json::{json, Value};

use crate::audit::{AuditEvent, Component};
use crate::integrity::Fingerprint;
use crate::stages::transform::encode_samples;
use crate::stages::{ArtifactRef, StageContext};
use crate::store::{MetadataRecord, StoreResult, Zone};

/// Artifact plus metadata as produced by a generator
#[derive(Debug, Clone)]
pub struct GeneratedProduct {
    pub artifact: Vec<u8>,
    pub metadata: MetadataRecord,
}

/// Source of new products
pub trait Generator: Send + Sync {
    /// `corrupted` asks for a sensor defect the QC step must catch
    fn generate(&self, product_id: &str, corrupted: bool) -> GeneratedProduct;
}

/// Simulated multispectral sensor: `rows × cols × bands` little-endian `f32`
/// samples, uniform in `[0, 1)`
#[derive(Debug, Clone)]
pub struct SyntheticGenerator {
    pub rows: usize,
    pub cols: usize,
    pub bands: usize,
    pub source_identifier: String,
    pub orbit: u64,
}

impl Default for SyntheticGenerator {
    fn default() -> Self {
        Self {
            rows: 100,
            cols: 100,
            bands: 3,
            source_identifier: "Simulated-MSI".to_string(),
            orbit: 1234,
        }
    }
}

impl SyntheticGenerator {
    /// Sample index of the dead pixel injected into corrupted products
    pub fn dead_pixel_index(&self) -> usize {
        ((self.rows / 2) * self.cols + self.cols / 2) * self.bands
    }
}

impl Generator for SyntheticGenerator {
    fn generate(&self, product_id: &str, corrupted: bool) -> GeneratedProduct {
        let mut rng = rand::thread_rng();
        let mut samples: Vec<f32> = (0..self.rows * self.cols * self.bands)
            .map(|_| rng.gen::<f32>())
            .collect();
        if corrupted {
            if let Some(sample) = samples.get_mut(self.dead_pixel_index()) {
                *sample = f32::NAN;
            }
        }

        let mut metadata = MetadataRecord::new(product_id, &self.source_identifier);
        metadata.extra.insert("orbit".to_string(), json!(self.orbit));
        metadata.extra.insert(
            "cloud_cover_percentage".to_string(),
            json!(rng.gen_range(0.0..100.0f64)),
        );
        metadata.extra.insert(
            "dimensions".to_string(),
            Value::from(vec![self.rows, self.cols, self.bands]),
        );

        GeneratedProduct {
            artifact: encode_samples(&samples),
            metadata,
        }
    }
}

/// Write a generated product into the landing zone
pub fn land(
    ctx: &StageContext<'_>,
    product_id: &str,
    product: &GeneratedProduct,
) -> StoreResult<ArtifactRef> {
    let path = ctx.store.write_data(Zone::Landing, product_id, &product.artifact)?;
    if let Err(e) = ctx.store.write_meta(Zone::Landing, product_id, &product.metadata) {
        let _ = ctx.store.remove_data(Zone::Landing, product_id);
        return Err(e);
    }

    let fingerprint = Fingerprint::of_bytes(&product.artifact);
    ctx.emit(
        AuditEvent::info(
            Component::Generator,
            "generator.landed",
            format!("Product landed at {}", path.display()),
        )
        .product(product_id)
        .data(json!({ "bytes": product.artifact.len() })),
    );
    Ok(ArtifactRef {
        product_id: product_id.to_string(),
        zone: Zone::Landing,
        path,
        fingerprint,
    })
}
