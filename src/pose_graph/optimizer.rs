//! Levenberg-Marquardt pose-graph refinement.
//!
//! Follows a three-phase pattern:
//! 1. COLLECT: pick the variable keyframes, the constraints touching them and
//!    the fixed poses at the boundary
//! 2. SOLVE: damped Gauss-Newton on `[rotation_vector, translation]` per pose
//!    with a numerical Jacobian per constraint
//! 3. APPLY: write the refined poses back into the graph
//!
//! The normal equations are accumulated block-wise per constraint, so the cost
//! of a local pass depends on the window size and its constraints only.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, Matrix6, Vector6};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::graph::{Constraint, PoseGraph};
use crate::geometry::SE3;
use crate::map::KeyFrameId;

const JACOBIAN_EPS: f64 = 1e-6;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;

/// Configuration for pose graph refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseGraphConfig {
    /// Number of most recent keyframes optimized by a local pass.
    pub local_window: usize,

    /// LM iterations for a local pass.
    pub max_iterations: usize,

    /// LM iterations per block of a full pass.
    pub full_max_iterations: usize,

    /// Largest number of keyframes solved densely at once during a full
    /// pass. Bigger graphs are swept in overlapping blocks.
    pub max_dense_keyframes: usize,

    /// Convergence threshold on parameter change.
    pub param_tolerance: f64,

    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,

    /// Information weight of sequential constraints.
    pub sequential_information: f64,

    /// Information weight per shared landmark of covisibility constraints.
    pub covisibility_information_per_landmark: f64,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            local_window: 10,
            max_iterations: 20,
            full_max_iterations: 50,
            max_dense_keyframes: 200,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-9,
            sequential_information: 1.0,
            covisibility_information_per_landmark: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineScope {
    Local,
    Full,
}

/// Outcome of a refinement pass.
#[derive(Debug, Clone)]
pub struct RefineReport {
    pub scope: RefineScope,
    /// Keyframes whose pose was a free variable.
    pub optimized: usize,
    pub iterations: usize,
    /// Weighted squared error of the touched constraints before the pass.
    pub initial_error: f64,
    /// Same error after the pass.
    pub final_error: f64,
    pub updated: Vec<KeyFrameId>,
}

impl RefineReport {
    fn empty(scope: RefineScope) -> Self {
        Self {
            scope,
            optimized: 0,
            iterations: 0,
            initial_error: 0.0,
            final_error: 0.0,
            updated: Vec::new(),
        }
    }
}

/// Data extracted for one optimization problem.
struct ProblemData {
    variables: Vec<KeyFrameId>,
    initial: HashMap<KeyFrameId, SE3>,
    fixed: HashMap<KeyFrameId, SE3>,
    edges: Vec<Constraint>,
}

struct Solution {
    poses: HashMap<KeyFrameId, SE3>,
    iterations: usize,
    initial_error: f64,
    final_error: f64,
}

impl PoseGraph {
    /// Incremental pass over the most recent `local_window` keyframes.
    ///
    /// Keyframes outside the window that share a constraint with it are held
    /// fixed. When the window spans the whole graph the oldest keyframe is
    /// held fixed instead.
    pub fn refine_local(&mut self, config: &PoseGraphConfig) -> RefineReport {
        let mut window = self.recent_ids(config.local_window);
        if window.len() == self.len() {
            let first = self.first_id();
            window.retain(|id| Some(*id) != first);
        }
        self.refine_ids(&window, config.max_iterations, RefineScope::Local, config)
    }

    /// Pass over every keyframe except the first, which anchors the gauge.
    pub fn refine_full(&mut self, config: &PoseGraphConfig) -> RefineReport {
        let first = self.first_id();
        let ids: Vec<KeyFrameId> = self
            .keyframes()
            .map(|kf| kf.id)
            .filter(|id| Some(*id) != first)
            .collect();
        if ids.is_empty() {
            return RefineReport::empty(RefineScope::Full);
        }

        let initial_error = self.total_error();
        let block = config.max_dense_keyframes.max(2);
        let step = (block / 2).max(1);

        let mut report = RefineReport::empty(RefineScope::Full);
        let mut updated: HashSet<KeyFrameId> = HashSet::new();
        let mut start = 0;
        loop {
            let end = (start + block).min(ids.len());
            let part =
                self.refine_ids(&ids[start..end], config.full_max_iterations, RefineScope::Full, config);
            report.iterations += part.iterations;
            updated.extend(part.updated);
            if end == ids.len() {
                break;
            }
            start += step;
        }

        report.optimized = ids.len();
        report.initial_error = initial_error;
        report.final_error = self.total_error();
        report.updated = updated.into_iter().collect();
        report.updated.sort();
        debug!(
            keyframes = report.optimized,
            iterations = report.iterations,
            initial_error = report.initial_error,
            final_error = report.final_error,
            "full pose graph refinement"
        );
        report
    }

    /// Weighted squared error over every constraint.
    pub fn total_error(&self) -> f64 {
        self.constraints()
            .iter()
            .filter_map(|c| {
                let from = self.keyframe(c.from)?;
                let to = self.keyframe(c.to)?;
                Some(edge_residual(c, &from.pose, &to.pose).norm_squared())
            })
            .sum()
    }

    fn refine_ids(
        &mut self,
        ids: &[KeyFrameId],
        max_iterations: usize,
        scope: RefineScope,
        config: &PoseGraphConfig,
    ) -> RefineReport {
        let Some(problem) = collect_problem(self, ids) else {
            return RefineReport::empty(scope);
        };
        let Some(solution) = solve(&problem, max_iterations, config) else {
            return RefineReport::empty(scope);
        };
        let updated = apply_solution(self, &solution);

        RefineReport {
            scope,
            optimized: problem.variables.len(),
            iterations: solution.iterations,
            initial_error: solution.initial_error,
            final_error: solution.final_error,
            updated,
        }
    }
}

/// PHASE 1: collect variables, edges and boundary poses.
fn collect_problem(graph: &PoseGraph, ids: &[KeyFrameId]) -> Option<ProblemData> {
    let mut variables: Vec<KeyFrameId> = ids
        .iter()
        .copied()
        .filter(|id| graph.keyframe(*id).is_some())
        .collect();
    variables.sort();
    variables.dedup();
    let var_set: HashSet<KeyFrameId> = variables.iter().copied().collect();

    let mut edge_indices: HashSet<usize> = HashSet::new();
    for id in &variables {
        edge_indices.extend(graph.constraint_indices_of(*id).iter().copied());
    }
    let mut edge_indices: Vec<usize> = edge_indices.into_iter().collect();
    edge_indices.sort_unstable();
    let edges: Vec<Constraint> = edge_indices
        .into_iter()
        .map(|idx| graph.constraints()[idx].clone())
        .collect();

    let mut initial = HashMap::new();
    let mut fixed = HashMap::new();
    for edge in &edges {
        for end in [edge.from, edge.to] {
            let pose = graph.keyframe(end)?.pose;
            if var_set.contains(&end) {
                initial.insert(end, pose);
            } else {
                fixed.insert(end, pose);
            }
        }
    }

    // Unconstrained variables have nothing to move them
    variables.retain(|id| initial.contains_key(id));
    if variables.is_empty() || edges.is_empty() {
        return None;
    }
    if fixed.is_empty() {
        let anchor = variables.remove(0);
        if let Some(pose) = initial.remove(&anchor) {
            fixed.insert(anchor, pose);
        }
        if variables.is_empty() {
            return None;
        }
    }

    Some(ProblemData {
        variables,
        initial,
        fixed,
        edges,
    })
}

/// PHASE 2: Levenberg-Marquardt.
fn solve(problem: &ProblemData, max_iterations: usize, config: &PoseGraphConfig) -> Option<Solution> {
    let n_params = problem.variables.len() * 6;
    let index: HashMap<KeyFrameId, usize> = problem
        .variables
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();

    let mut params = DVector::zeros(n_params);
    for (i, id) in problem.variables.iter().enumerate() {
        let tangent = problem.initial.get(id)?.log();
        for (k, value) in tangent.iter().enumerate() {
            params[i * 6 + k] = *value;
        }
    }

    let initial_error = problem_error(problem, &index, &params);
    let mut current_error = initial_error;
    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;

    for iter in 0..max_iterations {
        iterations = iter + 1;

        let (hessian, gradient) = normal_equations(problem, &index, &params);
        if gradient.norm() < config.gradient_tolerance {
            break;
        }

        let mut damped = hessian.clone();
        for i in 0..n_params {
            damped[(i, i)] += lambda * hessian[(i, i)].max(1e-6);
        }

        let rhs = -&gradient;
        let delta = match damped.clone().cholesky() {
            Some(chol) => chol.solve(&rhs),
            None => match damped.lu().solve(&rhs) {
                Some(d) => d,
                None => break,
            },
        };

        if delta.norm() < config.param_tolerance * (params.norm() + config.param_tolerance) {
            break;
        }

        let trial = &params + &delta;
        let trial_error = problem_error(problem, &index, &trial);
        if trial_error < current_error {
            params = trial;
            current_error = trial_error;
            lambda = (lambda * LAMBDA_DOWN).max(MIN_LAMBDA);
        } else {
            lambda = (lambda * LAMBDA_UP).min(MAX_LAMBDA);
        }
    }

    let poses = problem
        .variables
        .iter()
        .map(|&id| (id, pose_at(problem, &index, &params, id)))
        .collect();

    Some(Solution {
        poses,
        iterations,
        initial_error,
        final_error: current_error,
    })
}

/// PHASE 3: write back.
fn apply_solution(graph: &mut PoseGraph, solution: &Solution) -> Vec<KeyFrameId> {
    let mut updated: Vec<KeyFrameId> = solution
        .poses
        .iter()
        .filter_map(|(&id, pose)| graph.set_pose(id, *pose).then_some(id))
        .collect();
    updated.sort();
    updated
}

fn pose_at(
    problem: &ProblemData,
    index: &HashMap<KeyFrameId, usize>,
    params: &DVector<f64>,
    id: KeyFrameId,
) -> SE3 {
    match index.get(&id) {
        Some(&i) => SE3::exp(&tangent_at(params, i)),
        None => problem.fixed.get(&id).copied().unwrap_or_else(SE3::identity),
    }
}

fn tangent_at(params: &DVector<f64>, i: usize) -> [f64; 6] {
    let mut t = [0.0; 6];
    for (k, value) in t.iter_mut().enumerate() {
        *value = params[i * 6 + k];
    }
    t
}

/// Whitened residual `sqrt(info) * log(Z^{-1} * T_from^{-1} * T_to)`.
fn edge_residual(edge: &Constraint, from: &SE3, to: &SE3) -> Vector6<f64> {
    let predicted = from.between(to);
    let error = edge.measurement.inverse().compose(&predicted);
    Vector6::from_row_slice(&error.log()) * edge.information.max(0.0).sqrt()
}

fn problem_error(
    problem: &ProblemData,
    index: &HashMap<KeyFrameId, usize>,
    params: &DVector<f64>,
) -> f64 {
    problem
        .edges
        .iter()
        .map(|edge| {
            let from = pose_at(problem, index, params, edge.from);
            let to = pose_at(problem, index, params, edge.to);
            edge_residual(edge, &from, &to).norm_squared()
        })
        .sum()
}

/// Central-difference Jacobian of `f` with respect to the tangent of one pose.
fn numeric_jacobian(tangent: &[f64; 6], f: impl Fn(&SE3) -> Vector6<f64>) -> Matrix6<f64> {
    let mut jacobian = Matrix6::zeros();
    for p in 0..6 {
        let mut plus = *tangent;
        let mut minus = *tangent;
        plus[p] += JACOBIAN_EPS;
        minus[p] -= JACOBIAN_EPS;
        let column = (f(&SE3::exp(&plus)) - f(&SE3::exp(&minus))) / (2.0 * JACOBIAN_EPS);
        jacobian.set_column(p, &column);
    }
    jacobian
}

/// Accumulate `H = Σ JᵀJ` and `g = Σ Jᵀr` block by block.
fn normal_equations(
    problem: &ProblemData,
    index: &HashMap<KeyFrameId, usize>,
    params: &DVector<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let n_params = params.len();
    let mut hessian = DMatrix::zeros(n_params, n_params);
    let mut gradient = DVector::zeros(n_params);

    for edge in &problem.edges {
        let from = pose_at(problem, index, params, edge.from);
        let to = pose_at(problem, index, params, edge.to);
        let residual = edge_residual(edge, &from, &to);

        let mut blocks: Vec<(usize, Matrix6<f64>)> = Vec::with_capacity(2);
        if let Some(&i) = index.get(&edge.from) {
            let j = numeric_jacobian(&tangent_at(params, i), |p| edge_residual(edge, p, &to));
            blocks.push((i, j));
        }
        if let Some(&i) = index.get(&edge.to) {
            let j = numeric_jacobian(&tangent_at(params, i), |p| edge_residual(edge, &from, p));
            blocks.push((i, j));
        }

        for (a, ja) in &blocks {
            let mut g = gradient.fixed_rows_mut::<6>(a * 6);
            g += ja.transpose() * residual;
            for (b, jb) in &blocks {
                let mut h = hessian.fixed_view_mut::<6, 6>(a * 6, b * 6);
                h += ja.transpose() * jb;
            }
        }
    }

    (hessian, gradient)
}
