//! Differentiable spatial transformer operator
//!
//! [`SpatialTransformer`] binds the scaler and the resampler into a node with
//! two inputs (image, physical map) and one output (warped image). A forward
//! call records the operands it needs in a single slot; the matching backward
//! call consumes them.
//!
//! ```text
//! Idle --forward--> ForwardComputed --backward--> Idle
//!                   ForwardComputed --forward--> ForwardComputed (previous slot dropped)
//! ```
//!
//! Failed calls leave the slot untouched, so a caller can correct its input
//! and retry.

use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD};

use crate::backend::{self, Backend, ComputeCapabilities, ComputeUnit};
use crate::config::TransformerConfig;
use crate::error::{Result, StnError};
use crate::scalar::Geometry;
use crate::scale::{scale_map, unscale_gradient, validate_spacing};
use crate::{contiguous, contiguous_mut, BoundaryPolicy, Element};

/// Operator state with respect to the saved-operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Idle,
    ForwardComputed,
}

/// Where and when a forward call ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Compute unit that ran the forward pass (and will run the backward).
    pub unit: ComputeUnit,
    /// 1-based forward call counter of the owning operator.
    pub call: u64,
}

#[derive(Debug)]
struct SavedOperands<T: Element> {
    geom: Geometry,
    image: ArrayD<T>,
    scaled_map: ArrayD<T>,
    context: ExecutionContext,
    backend: Arc<dyn Backend<T>>,
}

/// Two-input differentiable node as driven by an automatic differentiation
/// engine: `apply` on the way forward, `grad` on the way back.
pub trait Differentiable<T: Element> {
    /// Warp `image` with the physical coordinate `map`.
    fn apply(&mut self, image: &ArrayViewD<T>, map: &ArrayViewD<T>) -> Result<ArrayD<T>>;

    /// Gradients `(grad_image, grad_map)` of the pending `apply`.
    fn grad(&mut self, grad_output: &ArrayViewD<T>) -> Result<(ArrayD<T>, ArrayD<T>)>;
}

/// Spatial transformer for one `(spacing, boundary policy)` configuration.
///
/// One instance serves one caller: forward/backward pairs must not overlap.
#[derive(Debug)]
pub struct SpatialTransformer<T: Element> {
    spacing: Vec<f64>,
    boundary: BoundaryPolicy,
    backend: Arc<dyn Backend<T>>,
    saved: Option<SavedOperands<T>>,
    calls: u64,
    last_context: Option<ExecutionContext>,
}

impl<T: Element> SpatialTransformer<T> {
    /// Create an operator on the preferred compute unit of `caps`.
    ///
    /// # Errors
    ///
    /// [`StnError::Config`] for empty or non-positive spacing.
    pub fn new(spacing: &[f64], zero_boundary: bool, caps: &ComputeCapabilities) -> Result<Self> {
        Self::with_unit(spacing, zero_boundary, caps.preferred_unit(), caps)
    }

    /// Create an operator on an explicit compute unit.
    ///
    /// # Errors
    ///
    /// [`StnError::Config`] for invalid spacing, [`StnError::Compute`] if
    /// `caps` does not provide `unit`.
    pub fn with_unit(
        spacing: &[f64],
        zero_boundary: bool,
        unit: ComputeUnit,
        caps: &ComputeCapabilities,
    ) -> Result<Self> {
        validate_spacing(spacing)?;
        let backend = backend::select(unit, caps)?;
        Self::with_backend(spacing, zero_boundary, backend)
    }

    /// Create an operator on an already constructed backend.
    pub fn with_backend(
        spacing: &[f64],
        zero_boundary: bool,
        backend: Arc<dyn Backend<T>>,
    ) -> Result<Self> {
        validate_spacing(spacing)?;
        Ok(Self {
            spacing: spacing.to_vec(),
            boundary: BoundaryPolicy::from_zero_boundary(zero_boundary),
            backend,
            saved: None,
            calls: 0,
            last_context: None,
        })
    }

    /// Create an operator from a JSON configuration.
    pub fn from_config(config: &TransformerConfig, caps: &ComputeCapabilities) -> Result<Self> {
        config.validate()?;
        Self::with_unit(
            &config.spacing,
            config.zero_boundary,
            config.resolve_unit(caps),
            caps,
        )
    }

    pub fn spacing(&self) -> &[f64] {
        &self.spacing
    }

    pub fn boundary(&self) -> BoundaryPolicy {
        self.boundary
    }

    /// Compute unit used by the next forward call.
    pub fn unit(&self) -> ComputeUnit {
        self.backend.unit()
    }

    pub fn state(&self) -> OperatorState {
        if self.saved.is_some() {
            OperatorState::ForwardComputed
        } else {
            OperatorState::Idle
        }
    }

    /// Context of the most recent successful forward call, kept after its
    /// backward completes.
    pub fn last_context(&self) -> Option<ExecutionContext> {
        self.last_context
    }

    /// Context of the pending forward call, if any.
    pub fn pending_context(&self) -> Option<ExecutionContext> {
        self.saved.as_ref().map(|s| s.context)
    }

    /// Route subsequent forward calls to another backend. A pending backward
    /// still runs where its forward ran.
    pub fn set_backend(&mut self, backend: Arc<dyn Backend<T>>) {
        self.backend = backend;
    }

    /// Drop any saved operands without computing gradients.
    pub fn reset(&mut self) {
        self.saved = None;
    }

    /// Warp `image` `(B, C, spatial...)` with the physical map
    /// `(B, D, spatial'...)`.
    ///
    /// # Returns
    ///
    /// The warped image `(B, C, spatial'...)`.
    ///
    /// # Errors
    ///
    /// [`StnError::Shape`] if `map` does not have rank `spacing.len() + 2` or
    /// is inconsistent with `image`. On error the saved slot is unchanged.
    pub fn forward(&mut self, image: &ArrayViewD<T>, map: &ArrayViewD<T>) -> Result<ArrayD<T>> {
        if map.ndim() != self.spacing.len() + 2 {
            return Err(StnError::shape(format!(
                "map rank {} does not match spacing length {} + 2",
                map.ndim(),
                self.spacing.len()
            )));
        }

        let scaled_map = scale_map(map, &self.spacing)?;
        let geom = Geometry::new(image.shape(), scaled_map.shape())?;
        let image = image.as_standard_layout().into_owned();

        let mut output = ArrayD::zeros(geom.output_shape());
        self.backend.resample(
            &geom,
            contiguous(&image)?,
            contiguous(&scaled_map)?,
            self.boundary,
            contiguous_mut(&mut output)?,
        );

        self.calls += 1;
        let context = ExecutionContext {
            unit: self.backend.unit(),
            call: self.calls,
        };
        if let Some(previous) = &self.saved {
            tracing::debug!(
                call = previous.context.call,
                "dropping saved operands of a forward call without backward"
            );
        }
        tracing::debug!(
            image = ?geom.image_shape(),
            map = ?geom.map_shape(),
            unit = %context.unit,
            call = context.call,
            "spatial transform forward"
        );

        self.last_context = Some(context);
        self.saved = Some(SavedOperands {
            geom,
            image,
            scaled_map,
            context,
            backend: Arc::clone(&self.backend),
        });
        Ok(output)
    }

    /// Gradients of the pending forward call.
    ///
    /// # Returns
    ///
    /// `(grad_image, grad_map)` shaped like the forward inputs; `grad_map` is
    /// with respect to the physical map.
    ///
    /// # Errors
    ///
    /// [`StnError::State`] without a pending forward, [`StnError::Shape`] if
    /// `grad_output` does not match the forward output. On error the saved
    /// operands are kept.
    pub fn backward(&mut self, grad_output: &ArrayViewD<T>) -> Result<(ArrayD<T>, ArrayD<T>)> {
        let saved = self
            .saved
            .as_ref()
            .ok_or_else(|| StnError::state("backward called without a pending forward"))?;
        saved.geom.check_grad_output(grad_output.shape())?;
        let grad_output = grad_output.as_standard_layout().into_owned();

        let mut grad_image = ArrayD::zeros(saved.image.raw_dim());
        let mut grad_map = ArrayD::zeros(saved.scaled_map.raw_dim());
        saved.backend.resample_grad(
            &saved.geom,
            contiguous(&saved.image)?,
            contiguous(&saved.scaled_map)?,
            contiguous(&grad_output)?,
            self.boundary,
            contiguous_mut(&mut grad_image)?,
            contiguous_mut(&mut grad_map)?,
        );
        let grad_map = unscale_gradient(grad_map, &self.spacing)?;

        tracing::debug!(
            unit = %saved.context.unit,
            call = saved.context.call,
            "spatial transform backward"
        );
        self.saved = None;
        Ok((grad_image, grad_map))
    }
}

impl<T: Element> Differentiable<T> for SpatialTransformer<T> {
    #[inline]
    fn apply(&mut self, image: &ArrayViewD<T>, map: &ArrayViewD<T>) -> Result<ArrayD<T>> {
        self.forward(image, map)
    }

    #[inline]
    fn grad(&mut self, grad_output: &ArrayViewD<T>) -> Result<(ArrayD<T>, ArrayD<T>)> {
        self.backward(grad_output)
    }
}
