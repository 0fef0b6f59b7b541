//! Motion-only bundle adjustment.
//!
//! Optimizes only the current frame's world-to-camera pose; landmarks stay
//! fixed. Runs four rounds of damped Gauss-Newton (Levenberg-Marquardt with
//! multiplicative diagonal damping): between rounds, observations whose
//! chi-square exceeds the per-kind gate are flagged as outliers and excluded
//! from the next round. The robust Huber kernel is dropped in the final
//! round so surviving inliers are weighted exactly.
//!
//! The pose is perturbed on the left: `T_cw <- exp([w, v]) * T_cw`, so for a
//! camera-frame point `p`, `dp/dw = -[p]x` and `dp/dv = I`.

use nalgebra::{
    Matrix2x3, Matrix3, Matrix6, SMatrix, UnitQuaternion, Vector2, Vector3, Vector4, Vector6,
};
use tracing::debug;

use crate::frame::camera::CameraModel;
use crate::geometry::{skew, SE3};
use crate::matcher::transform_plane;

/// One residual block for the pose optimizer. `index` identifies the frame
/// slot (keypoint, line or plane index) so the caller can map outlier flags
/// back onto the frame.
#[derive(Debug, Clone)]
pub enum Observation {
    /// 2D reprojection of a landmark without depth.
    MonoPoint {
        index: usize,
        uv: Vector2<f64>,
        point: Vector3<f64>,
        inv_sigma2: f64,
    },
    /// 3-component (u, v, uR) reprojection using the virtual right image.
    StereoPoint {
        index: usize,
        uvr: Vector3<f64>,
        point: Vector3<f64>,
        inv_sigma2: f64,
    },
    /// Point-to-line distances of the projected 3D endpoints to the observed
    /// 2D segment's infinite line `coeffs = (a, b, c)`, `a^2 + b^2 = 1`.
    Line {
        index: usize,
        coeffs: Vector3<f64>,
        start: Vector3<f64>,
        end: Vector3<f64>,
        inv_sigma2: f64,
    },
    /// Difference between observed camera-frame plane coefficients and the
    /// transformed map plane (normal components + offset).
    Plane {
        index: usize,
        coeffs_obs: Vector4<f64>,
        coeffs_world: Vector4<f64>,
    },
}

impl Observation {
    pub fn index(&self) -> usize {
        match self {
            Observation::MonoPoint { index, .. } => *index,
            Observation::StereoPoint { index, .. } => *index,
            Observation::Line { index, .. } => *index,
            Observation::Plane { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoseOptimizerConfig {
    pub rounds: usize,
    pub iterations_per_round: usize,
    /// 95% chi-square gates: 2 dof for mono and line, 3 dof for stereo and
    /// the weighted plane residual.
    pub chi2_mono: f64,
    pub chi2_stereo: f64,
    pub chi2_line: f64,
    pub chi2_plane: f64,
    /// Weights applied to the plane residual components.
    pub plane_normal_weight: f64,
    pub plane_offset_weight: f64,
    /// Information weight of the optional rotation prior.
    pub rotation_prior_weight: f64,
    /// The optimization fails when fewer inliers survive.
    pub min_inliers: usize,
}

impl Default for PoseOptimizerConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            iterations_per_round: 10,
            chi2_mono: 5.991,
            chi2_stereo: 7.815,
            chi2_line: 5.991,
            chi2_plane: 7.815,
            plane_normal_weight: 10.0,
            plane_offset_weight: 20.0,
            rotation_prior_weight: 100.0,
            min_inliers: 10,
        }
    }
}

#[derive(Debug)]
pub struct PoseOptimization {
    pub pose_cw: SE3,
    pub num_inliers: usize,
    /// Aligned with the `observations` argument.
    pub outliers: Vec<bool>,
}

/// Optimize the frame pose over the given residuals.
///
/// `rotation_prior` is an optional target `R_cw` (from the Manhattan
/// detector) pulled in softly; it never replaces the visual solution.
///
/// Returns `None` on degenerate geometry (singular normal equations in the
/// first round) or when fewer than `min_inliers` observations survive.
pub fn optimize_pose(
    initial_pose_cw: &SE3,
    observations: &[Observation],
    camera: &CameraModel,
    rotation_prior: Option<&UnitQuaternion<f64>>,
    config: &PoseOptimizerConfig,
) -> Option<PoseOptimization> {
    if observations.len() < config.min_inliers {
        return None;
    }

    let mut pose = initial_pose_cw.clone();
    let mut outliers = vec![false; observations.len()];

    for round in 0..config.rounds {
        let robust = round + 1 < config.rounds;
        let mut lambda = 1e-3;

        for iter in 0..config.iterations_per_round {
            let mut h = Matrix6::<f64>::zeros();
            let mut b = Vector6::<f64>::zeros();
            let mut n_active = 0usize;

            for (obs, &out) in observations.iter().zip(outliers.iter()) {
                if out {
                    continue;
                }
                accumulate(obs, &pose, camera, config, robust, &mut h, &mut b);
                n_active += 1;
            }
            if n_active < 3 {
                break;
            }
            if let Some(prior) = rotation_prior {
                accumulate_rotation_prior(prior, &pose, config.rotation_prior_weight, &mut h, &mut b);
            }

            let current_chi2 = total_chi2(observations, &outliers, &pose, camera, config);

            // Damped solve with step control: retry with stronger damping
            // until the error goes down.
            let mut accepted_step: Option<f64> = None;
            for _ in 0..5 {
                let mut damped = h;
                for i in 0..6 {
                    damped[(i, i)] += lambda * damped[(i, i)].max(1e-9);
                }
                let Some(delta) = damped.lu().solve(&(-b)) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = apply_delta(&pose, &delta);
                let candidate_chi2 =
                    total_chi2(observations, &outliers, &candidate, camera, config);
                if candidate_chi2 <= current_chi2 {
                    pose = candidate;
                    lambda = (lambda / 3.0).max(1e-9);
                    accepted_step = Some(delta.norm());
                    break;
                }
                lambda *= 10.0;
            }
            match accepted_step {
                Some(step) if step < 1e-10 => break,
                Some(_) => {}
                None => {
                    // A Hessian that cannot produce any improving step on the
                    // very first attempt means degenerate geometry.
                    if round == 0 && iter == 0 && h.determinant().abs() < 1e-12 {
                        return None;
                    }
                    break;
                }
            }
        }

        // Re-gate observations for the next round.
        for (i, obs) in observations.iter().enumerate() {
            let chi2 = chi2_of(obs, &pose, camera, config);
            outliers[i] = chi2 > gate_of(obs, config);
        }
    }

    let num_inliers = outliers.iter().filter(|&&o| !o).count();
    debug!(
        inliers = num_inliers,
        total = observations.len(),
        "pose optimization finished"
    );
    if num_inliers < config.min_inliers {
        return None;
    }

    Some(PoseOptimization {
        pose_cw: pose,
        num_inliers,
        outliers,
    })
}

/// Left-multiplicative pose update `T <- exp([w, v]) * T`.
fn apply_delta(pose: &SE3, delta: &Vector6<f64>) -> SE3 {
    let omega = Vector3::new(delta[0], delta[1], delta[2]);
    let v = Vector3::new(delta[3], delta[4], delta[5]);
    let rot = UnitQuaternion::from_scaled_axis(omega);
    SE3 {
        rotation: rot * pose.rotation,
        translation: rot * pose.translation + v,
    }
}

fn gate_of(obs: &Observation, config: &PoseOptimizerConfig) -> f64 {
    match obs {
        Observation::MonoPoint { .. } => config.chi2_mono,
        Observation::StereoPoint { .. } => config.chi2_stereo,
        Observation::Line { .. } => config.chi2_line,
        Observation::Plane { .. } => config.chi2_plane,
    }
}

fn total_chi2(
    observations: &[Observation],
    outliers: &[bool],
    pose: &SE3,
    camera: &CameraModel,
    config: &PoseOptimizerConfig,
) -> f64 {
    observations
        .iter()
        .zip(outliers.iter())
        .filter(|(_, &out)| !out)
        .map(|(obs, _)| chi2_of(obs, pose, camera, config).min(1e9))
        .sum()
}

/// Weighted squared residual of one observation under a pose.
fn chi2_of(obs: &Observation, pose: &SE3, camera: &CameraModel, config: &PoseOptimizerConfig) -> f64 {
    match obs {
        Observation::MonoPoint {
            uv,
            point,
            inv_sigma2,
            ..
        } => {
            let p = pose.transform_point(point);
            if p.z <= 0.0 {
                return f64::INFINITY;
            }
            let proj = Vector2::new(
                camera.fx * p.x / p.z + camera.cx,
                camera.fy * p.y / p.z + camera.cy,
            );
            (uv - proj).norm_squared() * inv_sigma2
        }
        Observation::StereoPoint {
            uvr,
            point,
            inv_sigma2,
            ..
        } => {
            let p = pose.transform_point(point);
            if p.z <= 0.0 {
                return f64::INFINITY;
            }
            let u = camera.fx * p.x / p.z + camera.cx;
            let v = camera.fy * p.y / p.z + camera.cy;
            let ur = u - camera.bf / p.z;
            let e = Vector3::new(uvr.x - u, uvr.y - v, uvr.z - ur);
            e.norm_squared() * inv_sigma2
        }
        Observation::Line {
            coeffs,
            start,
            end,
            inv_sigma2,
            ..
        } => {
            let mut chi2 = 0.0;
            for p_world in [start, end] {
                let p = pose.transform_point(p_world);
                if p.z <= 0.0 {
                    return f64::INFINITY;
                }
                let u = camera.fx * p.x / p.z + camera.cx;
                let v = camera.fy * p.y / p.z + camera.cy;
                let e = coeffs.x * u + coeffs.y * v + coeffs.z;
                chi2 += e * e * inv_sigma2;
            }
            chi2
        }
        Observation::Plane {
            coeffs_obs,
            coeffs_world,
            ..
        } => {
            let e = plane_residual(coeffs_obs, coeffs_world, pose, config).0;
            e.norm_squared()
        }
    }
}

/// Weighted plane residual and the (sign-aligned) predicted plane.
fn plane_residual(
    coeffs_obs: &Vector4<f64>,
    coeffs_world: &Vector4<f64>,
    pose: &SE3,
    config: &PoseOptimizerConfig,
) -> (Vector4<f64>, Vector3<f64>, f64) {
    let n_obs = coeffs_obs.xyz();
    let (mut n_pred, mut d_pred) = transform_plane(coeffs_world, pose);
    if n_obs.dot(&n_pred) < 0.0 {
        n_pred = -n_pred;
        d_pred = -d_pred;
    }
    let wn = config.plane_normal_weight;
    let wd = config.plane_offset_weight;
    let e = Vector4::new(
        wn * (n_obs.x - n_pred.x),
        wn * (n_obs.y - n_pred.y),
        wn * (n_obs.z - n_pred.z),
        wd * (coeffs_obs.w - d_pred),
    );
    (e, n_pred, d_pred)
}

/// Projection Jacobian rows `d(u, v)/dp` for a camera-frame point.
fn projection_jacobian(p: &Vector3<f64>, camera: &CameraModel) -> Matrix2x3<f64> {
    let inv_z = 1.0 / p.z;
    let inv_z2 = inv_z * inv_z;
    Matrix2x3::new(
        camera.fx * inv_z,
        0.0,
        -camera.fx * p.x * inv_z2,
        0.0,
        camera.fy * inv_z,
        -camera.fy * p.y * inv_z2,
    )
}

/// Huber IRLS weight for a weighted squared error against a gate.
fn huber_weight(chi2: f64, gate: f64, robust: bool) -> f64 {
    if !robust || chi2 <= gate {
        1.0
    } else {
        (gate / chi2).sqrt()
    }
}

/// Accumulate one observation into the normal equations.
fn accumulate(
    obs: &Observation,
    pose: &SE3,
    camera: &CameraModel,
    config: &PoseOptimizerConfig,
    robust: bool,
    h: &mut Matrix6<f64>,
    b: &mut Vector6<f64>,
) {
    match obs {
        Observation::MonoPoint {
            uv,
            point,
            inv_sigma2,
            ..
        } => {
            let p = pose.transform_point(point);
            if p.z <= 0.0 {
                return;
            }
            let proj = Vector2::new(
                camera.fx * p.x / p.z + camera.cx,
                camera.fy * p.y / p.z + camera.cy,
            );
            let e = uv - proj;
            let jp = projection_jacobian(&p, camera);
            // e = obs - proj(p), dp/dw = -[p]x, dp/dv = I.
            let j_rot = jp * skew(&p);
            let j_trans = -jp;
            let mut j = SMatrix::<f64, 2, 6>::zeros();
            j.fixed_view_mut::<2, 3>(0, 0).copy_from(&j_rot);
            j.fixed_view_mut::<2, 3>(0, 3).copy_from(&j_trans);

            let w = inv_sigma2 * huber_weight(e.norm_squared() * inv_sigma2, config.chi2_mono, robust);
            *h += j.transpose() * j * w;
            *b += j.transpose() * e * w;
        }
        Observation::StereoPoint {
            uvr,
            point,
            inv_sigma2,
            ..
        } => {
            let p = pose.transform_point(point);
            if p.z <= 0.0 {
                return;
            }
            let inv_z = 1.0 / p.z;
            let inv_z2 = inv_z * inv_z;
            let u = camera.fx * p.x * inv_z + camera.cx;
            let v = camera.fy * p.y * inv_z + camera.cy;
            let ur = u - camera.bf * inv_z;
            let e = Vector3::new(uvr.x - u, uvr.y - v, uvr.z - ur);

            let jp = Matrix3::new(
                camera.fx * inv_z,
                0.0,
                -camera.fx * p.x * inv_z2,
                0.0,
                camera.fy * inv_z,
                -camera.fy * p.y * inv_z2,
                camera.fx * inv_z,
                0.0,
                (-camera.fx * p.x + camera.bf) * inv_z2,
            );
            let j_rot = jp * skew(&p);
            let j_trans = -jp;
            let mut j = SMatrix::<f64, 3, 6>::zeros();
            j.fixed_view_mut::<3, 3>(0, 0).copy_from(&j_rot);
            j.fixed_view_mut::<3, 3>(0, 3).copy_from(&j_trans);

            let w =
                inv_sigma2 * huber_weight(e.norm_squared() * inv_sigma2, config.chi2_stereo, robust);
            *h += j.transpose() * j * w;
            *b += j.transpose() * e * w;
        }
        Observation::Line {
            coeffs,
            start,
            end,
            inv_sigma2,
            ..
        } => {
            let chi2 = chi2_of(obs, pose, camera, config);
            if !chi2.is_finite() {
                return;
            }
            let w_rob = huber_weight(chi2, config.chi2_line, robust);
            let l_ab = Vector2::new(coeffs.x, coeffs.y).transpose();
            for p_world in [start, end] {
                let p = pose.transform_point(p_world);
                if p.z <= 0.0 {
                    continue;
                }
                let u = camera.fx * p.x / p.z + camera.cx;
                let v = camera.fy * p.y / p.z + camera.cy;
                let e = coeffs.x * u + coeffs.y * v + coeffs.z;

                let jp = projection_jacobian(&p, camera);
                // e = l . proj(p): no sign flip relative to the projection.
                let row = l_ab * jp;
                let j_rot = -(row * skew(&p));
                let mut j = SMatrix::<f64, 1, 6>::zeros();
                // dp/dw = -[p]x, so de/dw = -row * [p]x.
                j.fixed_view_mut::<1, 3>(0, 0).copy_from(&j_rot);
                j.fixed_view_mut::<1, 3>(0, 3).copy_from(&row);

                let w = inv_sigma2 * w_rob;
                *h += j.transpose() * j * w;
                *b += j.transpose() * SMatrix::<f64, 1, 1>::new(e) * w;
            }
        }
        Observation::Plane {
            coeffs_obs,
            coeffs_world,
            ..
        } => {
            let (e, n_pred, _) = plane_residual(coeffs_obs, coeffs_world, pose, config);
            let chi2 = e.norm_squared();
            let w_rob = huber_weight(chi2, config.chi2_plane, robust);

            // e_n = wn * (n_obs - n_pred): dn_pred/dw = -[n_pred]x, no
            // translation dependence. e_d = wd * (d_obs - d_pred):
            // dd_pred/dw = 0, dd_pred/dv = -n_pred^T.
            let wn = config.plane_normal_weight;
            let wd = config.plane_offset_weight;
            let mut j = SMatrix::<f64, 4, 6>::zeros();
            j.fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(wn * skew(&n_pred)));
            j.fixed_view_mut::<1, 3>(3, 3)
                .copy_from(&(wd * n_pred.transpose()));

            *h += j.transpose() * j * w_rob;
            *b += j.transpose() * e * w_rob;
        }
    }
}

/// Soft rotation prior `R_cw ~ prior`, linearized as
/// `r = Log(R_cw * prior^-1)`, `dr/dw ~ I`.
fn accumulate_rotation_prior(
    prior: &UnitQuaternion<f64>,
    pose: &SE3,
    weight: f64,
    h: &mut Matrix6<f64>,
    b: &mut Vector6<f64>,
) {
    let r = (pose.rotation * prior.inverse()).scaled_axis();
    for i in 0..3 {
        h[(i, i)] += weight;
        b[i] += weight * r[i];
    }
}
