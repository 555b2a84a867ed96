//! Mean-field automatic differentiation variational inference.
//!
//! The approximation is a diagonal Gaussian `N(mu, diag(exp(omega))^2)` over
//! the unconstrained space, fitted by stochastic gradient ascent on the ELBO
//! with reparameterized gradients and an adaptive step size sequence.

use std::collections::VecDeque;

use itertools::izip;
use rand::{distr::Uniform, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use thiserror::Error;

use crate::{
    math::{mean, median},
    model::{LogpError, Model},
    params::{InitError, ParamMap},
};

const ETA_SEQUENCE: [f64; 5] = [100., 10., 1., 0.1, 0.01];
const TAU: f64 = 1.;
/// Weight of the newest squared gradient in the step size sequence
const ALPHA: f64 = 0.1;
const MAX_INIT_TRIES: usize = 100;

/// Settings for the variational fit, with CmdStan's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VariationalSettings {
    pub seed: u64,
    /// Fail instead of warning when the optimization does not converge
    pub require_converged: bool,
    /// Maximum number of iterations
    pub iter: u64,
    /// Monte Carlo draws per gradient estimate
    pub grad_samples: usize,
    /// Monte Carlo draws per ELBO estimate
    pub elbo_samples: usize,
    /// Fixed step size scale. `None` picks one by trial runs.
    pub eta: Option<f64>,
    /// Iterations per candidate during step size selection
    pub adapt_iter: u64,
    /// Evaluate the ELBO every `eval_elbo` iterations
    pub eval_elbo: u64,
    /// Relative ELBO change below which the fit counts as converged
    pub tol_rel_obj: f64,
    /// Number of approximate posterior draws to return
    pub output_samples: usize,
    pub init_radius: f64,
}

impl Default for VariationalSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            require_converged: false,
            iter: 10_000,
            grad_samples: 1,
            elbo_samples: 100,
            eta: None,
            adapt_iter: 50,
            eval_elbo: 100,
            tol_rel_obj: 0.01,
            output_samples: 1000,
            init_radius: 2.,
        }
    }
}

#[derive(Error, Debug)]
pub enum VariationalError {
    #[error("initial values are invalid")]
    Init(#[from] InitError),
    #[error("no finite log density after {0} random initializations")]
    InitFailed(usize),
    #[error("all proposed step sizes failed, the model may be ill-conditioned or misspecified")]
    EtaAdaptation,
    #[error("log density or its gradient is not finite at a draw from the approximation")]
    NonFiniteGradient,
    #[error("log density is not finite at any draw used to estimate the ELBO")]
    ElboFailed,
    #[error("optimization did not converge within {iterations} iterations")]
    NotConverged { iterations: u64 },
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid variational settings: {0}")]
    Settings(&'static str),
}

/// ELBO estimate at one evaluation point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ElboRecord {
    pub iter: u64,
    pub elbo: f64,
    pub rel_change_mean: f64,
    pub rel_change_median: f64,
}

/// The result of a variational fit.
#[derive(Debug, Clone)]
pub struct VariationalFit {
    /// The approximation's mean, mapped to the constrained scale
    pub estimate: ParamMap,
    pub param_names: Vec<String>,
    /// Mean of the approximation in unconstrained space
    pub mu: Box<[f64]>,
    /// Log standard deviations of the approximation in unconstrained space
    pub omega: Box<[f64]>,
    /// Draws from the approximation on the constrained scale
    pub draws: Vec<Box<[f64]>>,
    pub eta: f64,
    pub elbo_history: Vec<ElboRecord>,
    pub converged: bool,
    pub iterations: u64,
}

/// Diagonal Gaussian approximation in unconstrained space.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MeanField {
    mu: Box<[f64]>,
    omega: Box<[f64]>,
}

impl MeanField {
    pub(crate) fn new(mu: Box<[f64]>) -> Self {
        let omega = vec![0f64; mu.len()].into();
        MeanField { mu, omega }
    }

    fn dim(&self) -> usize {
        self.mu.len()
    }

    pub(crate) fn entropy(&self) -> f64 {
        0.5 * self.dim() as f64 * (1. + (2. * std::f64::consts::PI).ln())
            + self.omega.iter().sum::<f64>()
    }

    /// `zeta = mu + exp(omega) * eta`
    fn transform(&self, eta: &[f64], zeta: &mut [f64]) {
        izip!(zeta.iter_mut(), eta, self.mu.iter(), self.omega.iter())
            .for_each(|(z, &e, &m, &o)| *z = m + o.exp() * e);
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, eta: &mut [f64], zeta: &mut [f64]) {
        eta.iter_mut()
            .for_each(|e| *e = rng.sample(rand_distr::StandardNormal));
        self.transform(eta, zeta);
    }

    fn step(&mut self, grad: &ElboGradient, history: &ElboGradient, eta_scaled: f64) {
        izip!(self.mu.iter_mut(), grad.mu.iter(), history.mu.iter())
            .for_each(|(p, g, h)| *p += eta_scaled * g / (TAU + h.sqrt()));
        izip!(self.omega.iter_mut(), grad.omega.iter(), history.omega.iter())
            .for_each(|(p, g, h)| *p += eta_scaled * g / (TAU + h.sqrt()));
    }
}

#[derive(Debug, Clone)]
struct ElboGradient {
    mu: Box<[f64]>,
    omega: Box<[f64]>,
}

impl ElboGradient {
    fn zeros(dim: usize) -> Self {
        ElboGradient {
            mu: vec![0f64; dim].into(),
            omega: vec![0f64; dim].into(),
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut f64> {
        self.mu.iter_mut().chain(self.omega.iter_mut())
    }

    fn iter(&self) -> impl Iterator<Item = &f64> {
        self.mu.iter().chain(self.omega.iter())
    }

    /// Exponentially weighted average of squared gradients, started at the
    /// first squared gradient.
    fn accumulate_squares(&mut self, grad: &ElboGradient, first: bool) {
        self.iter_mut().zip(grad.iter()).for_each(|(h, g)| {
            *h = if first {
                g * g
            } else {
                ALPHA * g * g + (1. - ALPHA) * *h
            }
        });
    }
}

/// Holds the model and scratch space for gradient and ELBO estimates.
struct Advi<'model, M: Model> {
    model: &'model M,
    settings: VariationalSettings,
    eta: Box<[f64]>,
    zeta: Box<[f64]>,
    grad: Box<[f64]>,
}

impl<'model, M: Model> Advi<'model, M> {
    fn new(model: &'model M, settings: VariationalSettings) -> Self {
        let dim = model.dim();
        Advi {
            model,
            settings,
            eta: vec![0f64; dim].into(),
            zeta: vec![0f64; dim].into(),
            grad: vec![0f64; dim].into(),
        }
    }

    fn logp_at_zeta(&mut self) -> Result<Option<f64>, VariationalError> {
        match self.model.logp(&self.zeta, &mut self.grad) {
            Ok(logp) if logp.is_finite() => Ok(Some(logp)),
            Ok(_) => Ok(None),
            Err(err) if err.is_recoverable() => Ok(None),
            Err(err) => Err(VariationalError::LogpFailure(Box::new(err))),
        }
    }

    /// Reparameterization gradient of the ELBO, entropy term included.
    fn calc_grad<R: Rng + ?Sized>(
        &mut self,
        q: &MeanField,
        rng: &mut R,
    ) -> Result<ElboGradient, VariationalError> {
        let n = self.settings.grad_samples;
        let mut out = ElboGradient::zeros(q.dim());
        for _ in 0..n {
            q.sample(rng, &mut self.eta, &mut self.zeta);
            if self.logp_at_zeta()?.is_none() || self.grad.iter().any(|g| !g.is_finite()) {
                return Err(VariationalError::NonFiniteGradient);
            }
            izip!(out.mu.iter_mut(), out.omega.iter_mut(), self.grad.iter(), self.eta.iter())
                .for_each(|(gm, go, g, e)| {
                    *gm += g;
                    *go += g * e;
                });
        }
        out.mu.iter_mut().for_each(|g| *g /= n as f64);
        izip!(out.omega.iter_mut(), q.omega.iter())
            .for_each(|(g, o)| *g = *g / n as f64 * o.exp() + 1.);
        Ok(out)
    }

    /// Monte Carlo ELBO estimate. Draws with a non-finite log density are
    /// dropped.
    fn calc_elbo<R: Rng + ?Sized>(
        &mut self,
        q: &MeanField,
        rng: &mut R,
    ) -> Result<f64, VariationalError> {
        let mut sum = 0.;
        let mut kept = 0usize;
        for _ in 0..self.settings.elbo_samples {
            q.sample(rng, &mut self.eta, &mut self.zeta);
            if let Some(logp) = self.logp_at_zeta()? {
                sum += logp;
                kept += 1;
            }
        }
        if kept == 0 {
            return Err(VariationalError::ElboFailed);
        }
        Ok(sum / kept as f64 + q.entropy())
    }

    /// Run a few iterations for each candidate step size scale and keep
    /// the one that reaches the best ELBO.
    fn adapt_eta<R: Rng + ?Sized>(
        &mut self,
        init: &MeanField,
        rng: &mut R,
    ) -> Result<f64, VariationalError> {
        let elbo_init = self.calc_elbo(init, rng)?;
        let mut elbo_best = f64::NEG_INFINITY;
        let mut eta_best = None;

        for (idx, &eta) in ETA_SEQUENCE.iter().enumerate() {
            let mut q = init.clone();
            let mut history = ElboGradient::zeros(q.dim());
            for iter in 1..=self.settings.adapt_iter {
                // A diverging candidate just gets a bad ELBO.
                let grad = match self.calc_grad(&q, rng) {
                    Ok(grad) => grad,
                    Err(VariationalError::NonFiniteGradient) => ElboGradient::zeros(q.dim()),
                    Err(err) => return Err(err),
                };
                history.accumulate_squares(&grad, iter == 1);
                q.step(&grad, &history, eta * (iter as f64).powf(-0.5 + 1e-16));
            }
            let elbo = match self.calc_elbo(&q, rng) {
                Ok(elbo) => elbo,
                Err(VariationalError::ElboFailed) => f64::NEG_INFINITY,
                Err(err) => return Err(err),
            };
            tracing::debug!(eta, elbo, "step size candidate");

            let last = idx == ETA_SEQUENCE.len() - 1;
            if elbo < elbo_best && elbo_best > elbo_init {
                break;
            }
            if !last {
                elbo_best = elbo;
                eta_best = Some(eta);
            } else if elbo > elbo_init {
                eta_best = Some(eta);
            } else {
                return Err(VariationalError::EtaAdaptation);
            }
        }
        eta_best.ok_or(VariationalError::EtaAdaptation)
    }

    /// Stochastic gradient ascent until the relative ELBO change converges
    /// or the iteration limit is reached.
    fn optimize<R: Rng + ?Sized>(
        &mut self,
        q: &mut MeanField,
        eta: f64,
        rng: &mut R,
    ) -> Result<(Vec<ElboRecord>, bool, u64), VariationalError> {
        let settings = self.settings;
        let buffer_size =
            ((0.1 * settings.iter as f64 / settings.eval_elbo as f64) as usize).max(2);
        let mut rel_changes: VecDeque<f64> = VecDeque::with_capacity(buffer_size);
        let mut history = ElboGradient::zeros(q.dim());
        let mut records = vec![];
        let mut elbo = 0f64;
        let mut iterations = 0;

        for iter in 1..=settings.iter {
            iterations = iter;
            let grad = self.calc_grad(q, rng)?;
            history.accumulate_squares(&grad, iter == 1);
            q.step(&grad, &history, eta * (iter as f64).powf(-0.5 + 1e-16));

            if iter % settings.eval_elbo != 0 {
                continue;
            }
            let elbo_prev = elbo;
            elbo = self.calc_elbo(q, rng)?;
            if rel_changes.len() == buffer_size {
                rel_changes.pop_front();
            }
            rel_changes.push_back(((elbo_prev - elbo) / elbo).abs());
            let changes = rel_changes.make_contiguous();
            let record = ElboRecord {
                iter,
                elbo,
                rel_change_mean: mean(changes),
                rel_change_median: median(changes),
            };
            records.push(record);
            tracing::debug!(
                iter,
                elbo,
                rel_mean = record.rel_change_mean,
                rel_median = record.rel_change_median,
                "elbo"
            );

            if iter > 10 * settings.eval_elbo
                && (record.rel_change_mean > 0.5 || record.rel_change_median > 0.5)
            {
                tracing::warn!(iter, elbo, "relative ELBO change is large, the fit may be diverging");
            }
            if record.rel_change_mean < settings.tol_rel_obj
                || record.rel_change_median < settings.tol_rel_obj
            {
                tracing::info!(iter, elbo, "relative ELBO change converged");
                return Ok((records, true, iterations));
            }
        }
        Ok((records, false, iterations))
    }
}

fn validate(settings: &VariationalSettings) -> Result<(), VariationalError> {
    if settings.grad_samples == 0 {
        return Err(VariationalError::Settings("grad_samples must be positive"));
    }
    if settings.elbo_samples == 0 {
        return Err(VariationalError::Settings("elbo_samples must be positive"));
    }
    if settings.eval_elbo == 0 {
        return Err(VariationalError::Settings("eval_elbo must be positive"));
    }
    if let Some(eta) = settings.eta {
        if !(eta > 0. && eta.is_finite()) {
            return Err(VariationalError::Settings("eta must be positive"));
        }
    }
    if !(settings.init_radius > 0. && settings.init_radius.is_finite()) {
        return Err(VariationalError::Settings("init_radius must be positive"));
    }
    Ok(())
}

fn random_init<M: Model, R: Rng + ?Sized>(
    model: &M,
    radius: f64,
    rng: &mut R,
) -> Result<Box<[f64]>, VariationalError> {
    let dist = Uniform::new(-radius, radius)
        .map_err(|_| VariationalError::Settings("init_radius must be positive"))?;
    let mut position = vec![0f64; model.dim()];
    let mut grad = vec![0f64; model.dim()];
    for _ in 0..MAX_INIT_TRIES {
        position.iter_mut().for_each(|x| *x = rng.sample(dist));
        if let Ok(logp) = model.logp(&position, &mut grad) {
            if logp.is_finite() && grad.iter().all(|g| g.is_finite()) {
                return Ok(position.into());
            }
        }
    }
    Err(VariationalError::InitFailed(MAX_INIT_TRIES))
}

/// Fit a mean-field approximation starting from a random point.
pub fn fit_variational<M: Model>(
    model: &M,
    settings: VariationalSettings,
) -> Result<VariationalFit, VariationalError> {
    fit_variational_from(model, None, settings)
}

/// Fit a mean-field approximation, starting the approximation's mean at
/// `inits` if given.
pub fn fit_variational_from<M: Model>(
    model: &M,
    inits: Option<&ParamMap>,
    settings: VariationalSettings,
) -> Result<VariationalFit, VariationalError> {
    validate(&settings)?;
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);

    let init = match inits {
        Some(inits) => {
            let flat = inits.to_flat(model.params())?;
            let mut position = vec![0f64; model.dim()];
            model.unconstrain(&flat, &mut position)?;
            position.into()
        }
        None => random_init(model, settings.init_radius, &mut rng)?,
    };

    let mut advi = Advi::new(model, settings);
    let mut q = MeanField::new(init);

    let eta = match settings.eta {
        Some(eta) => eta,
        None => {
            let eta = advi.adapt_eta(&q, &mut rng)?;
            tracing::info!(eta, "selected step size scale");
            eta
        }
    };

    let (elbo_history, converged, iterations) = advi.optimize(&mut q, eta, &mut rng)?;
    if !converged {
        if settings.require_converged {
            return Err(VariationalError::NotConverged { iterations });
        }
        tracing::warn!(
            iterations,
            "variational optimization reached the iteration limit without converging, \
             the approximation may not be meaningful"
        );
    }

    let dim = model.dim();
    let mut constrained = vec![0f64; dim];
    model.constrain(&q.mu, &mut constrained);
    let estimate = ParamMap::from_flat(model.params(), &constrained)?;

    let mut eta_draw = vec![0f64; dim];
    let mut zeta = vec![0f64; dim];
    let draws = (0..settings.output_samples)
        .map(|_| {
            q.sample(&mut rng, &mut eta_draw, &mut zeta);
            let mut out = vec![0f64; dim];
            model.constrain(&zeta, &mut out);
            out.into_boxed_slice()
        })
        .collect();

    Ok(VariationalFit {
        estimate,
        param_names: model.param_names(),
        mu: q.mu,
        omega: q.omega,
        draws,
        eta,
        elbo_history,
        converged,
        iterations,
    })
}
