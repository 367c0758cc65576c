//! Turns goal regions selected on the mesh into grid boundary conditions.

use std::collections::{BTreeMap, BTreeSet};

use json::JsonValue;
use nalgebra::Vector3;

use crate::{
    analyzer::analyze_goal_region,
    datatypes::Mesh,
    error::{Result, TopoError},
    model::FeModel,
};

/// Per-axis tolerance under which an anchor and a load are the same place
pub const COINCIDENT_TOLERANCE: f64 = 1e-6;

pub fn default_load() -> Vector3<f64> {
    Vector3::new(0.0, -1.0, 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalKind {
    Anchor,
    Load,
}

/// A goal as the caller supplies it: a vertex selection plus free-form
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub kind: GoalKind,
    pub vertices: Vec<usize>,
    pub parameters: JsonValue,
}

impl Goal {
    pub fn anchor(vertices: Vec<usize>) -> Goal {
        Goal {
            kind: GoalKind::Anchor,
            vertices,
            parameters: JsonValue::new_object(),
        }
    }

    pub fn load(vertices: Vec<usize>, force: Vector3<f64>) -> Goal {
        let mut parameters = JsonValue::new_object();
        parameters["force"] = JsonValue::from(vec![force.x, force.y, force.z]);
        Goal {
            kind: GoalKind::Load,
            vertices,
            parameters,
        }
    }

    /// Resultant force of a load goal. Reads `force` as a 3-array, then the
    /// scalar `x`/`y`/`z` keys, then falls back to a unit downward load.
    pub fn force(&self) -> Vector3<f64> {
        let force = &self.parameters["force"];
        if force.is_array() && force.len() == 3 {
            let components: Vec<Option<f64>> = force.members().map(|v| v.as_f64()).collect();
            if let [Some(x), Some(y), Some(z)] = components.as_slice() {
                return Vector3::new(*x, *y, *z);
            }
            log::warn!("ignoring non-numeric force {}", force.dump());
        }

        let scalars = ["x", "y", "z"].map(|key| self.parameters[key].as_f64());
        if scalars.iter().any(|s| s.is_some()) {
            return Vector3::new(
                scalars[0].unwrap_or(0.0),
                scalars[1].unwrap_or(0.0),
                scalars[2].unwrap_or(0.0),
            );
        }

        default_load()
    }

    /// Per-axis constraint mask of an anchor goal; all axes unless `fix`
    /// says otherwise.
    pub fn fix_mask(&self) -> [bool; 3] {
        let fix = &self.parameters["fix"];
        let mut mask = [true; 3];
        if fix.is_array() {
            for (axis, value) in fix.members().take(3).enumerate() {
                mask[axis] = value.as_bool().unwrap_or(true);
            }
        }
        mask
    }
}

/// Grid nodes a region is spread over, with weights summing to one
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedNodes {
    pub nodes: Vec<usize>,
    pub weights: Vec<f64>,
}

impl DistributedNodes {
    /// Each node is weighted by how many of the points snap onto it
    pub fn from_points(model: &FeModel, points: &[Vector3<f64>]) -> DistributedNodes {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for point in points {
            *counts.entry(model.nearest_node(point)).or_insert(0) += 1;
        }

        let total = points.len().max(1) as f64;
        let (nodes, weights) = counts
            .into_iter()
            .map(|(node, count)| (node, count as f64 / total))
            .unzip();

        DistributedNodes { nodes, weights }
    }

    /// Splits `force` over the nodes. The last node takes the remainder so
    /// the parts add up to `force`.
    pub fn split(&self, force: &Vector3<f64>) -> Vec<(usize, Vector3<f64>)> {
        let mut assigned = Vector3::zeros();
        let mut parts = Vec::with_capacity(self.nodes.len());
        for (n, (&node, &weight)) in self.nodes.iter().zip(&self.weights).enumerate() {
            let part = if n + 1 == self.nodes.len() {
                force - assigned
            } else {
                force * weight
            };
            assigned += part;
            parts.push((node, part));
        }
        parts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnchorMarker {
    /// Display position, the area-weighted centroid of the region
    pub position: Vector3<f64>,
    pub vertices: Vec<usize>,
    pub positions: Vec<Vector3<f64>>,
    pub distributed: Option<DistributedNodes>,
    pub fix: [bool; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadMarker {
    /// Display position, the area-weighted centroid of the region
    pub position: Vector3<f64>,
    pub vertices: Vec<usize>,
    pub positions: Vec<Vector3<f64>>,
    pub distributed: Option<DistributedNodes>,
    /// Total resultant, spread over the distributed nodes
    pub force: Vector3<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoalMarkers {
    pub anchors: Vec<AnchorMarker>,
    pub loads: Vec<LoadMarker>,
}

fn coincident(a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
    (a - b).amax() <= COINCIDENT_TOLERANCE
}

fn resolve_vertices(mesh: &Mesh, goal: &Goal) -> (Vec<usize>, Vec<Vector3<f64>>) {
    goal.vertices
        .iter()
        .filter_map(|&i| mesh.vertex(i).map(|p| (i, p)))
        .unzip()
}

/// Builds anchor and load markers for the goal list on the model's grid.
///
/// Goal types without any vertex fall back to a single point: the lower
/// corner of the bounds for anchors, the upper corner for loads. Where an
/// anchor and a load meet, the load wins.
pub fn extract_goal_markers(mesh: &Mesh, goals: &[Goal], model: &FeModel) -> GoalMarkers {
    let mut markers = GoalMarkers::default();

    for goal in goals.iter().filter(|g| !g.vertices.is_empty()) {
        let metadata = analyze_goal_region(mesh, &goal.vertices);
        let (vertices, positions) = resolve_vertices(mesh, goal);
        if positions.is_empty() {
            log::warn!(
                "skipping {:?} goal: none of its {} vertices exist on the mesh",
                goal.kind,
                goal.vertices.len()
            );
            continue;
        }

        let distributed = Some(DistributedNodes::from_points(model, &positions));
        match goal.kind {
            GoalKind::Anchor => markers.anchors.push(AnchorMarker {
                position: metadata.weighted_centroid,
                vertices,
                positions,
                distributed,
                fix: goal.fix_mask(),
            }),
            GoalKind::Load => markers.loads.push(LoadMarker {
                position: metadata.weighted_centroid,
                vertices,
                positions,
                distributed,
                force: goal.force(),
            }),
        }
    }

    if markers.anchors.is_empty() {
        let position = model.bounds.min;
        log::info!("no anchor vertices given, anchoring at {:?}", position);
        markers.anchors.push(AnchorMarker {
            position,
            vertices: Vec::new(),
            positions: vec![position],
            distributed: Some(DistributedNodes::from_points(model, &[position])),
            fix: [true; 3],
        });
    }
    if markers.loads.is_empty() {
        let position = model.bounds.max;
        log::info!("no load vertices given, loading at {:?}", position);
        markers.loads.push(LoadMarker {
            position,
            vertices: Vec::new(),
            positions: vec![position],
            distributed: Some(DistributedNodes::from_points(model, &[position])),
            force: default_load(),
        });
    }

    resolve_conflicts(&mut markers, model);
    markers
}

/// Drops anchors placed on a load, then strips shared vertices from the
/// anchors that remain.
fn resolve_conflicts(markers: &mut GoalMarkers, model: &FeModel) {
    let loads = &markers.loads;
    let before = markers.anchors.len();
    markers
        .anchors
        .retain(|anchor| !loads.iter().any(|l| coincident(&anchor.position, &l.position)));
    if markers.anchors.len() < before {
        log::warn!(
            "dropped {} anchor(s) coinciding with a load",
            before - markers.anchors.len()
        );
    }

    let load_points: Vec<&Vector3<f64>> = loads.iter().flat_map(|l| l.positions.iter()).collect();
    for anchor in markers.anchors.iter_mut() {
        let shared: Vec<bool> = anchor
            .positions
            .iter()
            .map(|p| load_points.iter().any(|q| coincident(p, q)))
            .collect();
        if !shared.iter().any(|&s| s) {
            continue;
        }

        let mut keep = shared.iter().map(|s| !s);
        anchor.positions.retain(|_| keep.next().unwrap_or(true));
        if anchor.vertices.len() == shared.len() {
            let mut keep = shared.iter().map(|s| !s);
            anchor.vertices.retain(|_| keep.next().unwrap_or(true));
        }
        log::debug!(
            "removed {} shared vertices from an anchor",
            shared.iter().filter(|&&s| s).count()
        );
        anchor.distributed = Some(DistributedNodes::from_points(model, &anchor.positions));
    }
    markers.anchors.retain(|a| !a.positions.is_empty());
}

/// Fixed degrees of freedom and nodal forces of the grid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundaryConditions {
    pub fixed: BTreeSet<usize>,
    pub forces: BTreeMap<usize, f64>,
}

impl BoundaryConditions {
    pub fn from_markers(markers: &GoalMarkers, model: &FeModel) -> Result<BoundaryConditions> {
        let mut bcs = BoundaryConditions::default();

        let distribution = |position: &Vector3<f64>, distributed: &Option<DistributedNodes>| {
            let nodes = match distributed {
                Some(d) => d.clone(),
                None => DistributedNodes::from_points(model, &[*position]),
            };
            if nodes.nodes.len() != nodes.weights.len() {
                return Err(TopoError::Goal(
                    "distributed nodes and weights differ in length".to_owned(),
                ));
            }
            if let Some(&node) = nodes.nodes.iter().find(|&&n| n >= model.num_nodes) {
                return Err(TopoError::Goal(format!(
                    "grid node {} is out of range for a model with {} nodes",
                    node, model.num_nodes
                )));
            }
            Ok(nodes)
        };

        for anchor in &markers.anchors {
            let nodes = distribution(&anchor.position, &anchor.distributed)?;
            for node in nodes.nodes {
                for axis in (0..model.dim).filter(|&axis| anchor.fix[axis]) {
                    bcs.fixed.insert(node * model.dim + axis);
                }
            }
        }

        for load in &markers.loads {
            let nodes = distribution(&load.position, &load.distributed)?;
            if model.is_2d() && load.force.z != 0.0 {
                log::debug!("out-of-plane load component {} ignored", load.force.z);
            }
            for (node, part) in nodes.split(&load.force) {
                for axis in 0..model.dim {
                    *bcs.forces.entry(node * model.dim + axis).or_insert(0.0) += part[axis];
                }
            }
        }

        let clashing: Vec<usize> = bcs
            .forces
            .iter()
            .filter(|(dof, value)| **value != 0.0 && bcs.fixed.contains(dof))
            .map(|(dof, _)| *dof)
            .collect();
        if !clashing.is_empty() {
            log::warn!(
                "{} loaded degrees of freedom are also fixed; their loads are dropped",
                clashing.len()
            );
        }
        let fixed = &bcs.fixed;
        bcs.forces
            .retain(|dof, value| *value != 0.0 && !fixed.contains(dof));

        if bcs.fixed.is_empty() {
            return Err(TopoError::Goal(
                "no fixed degrees of freedom, the structure is unconstrained".to_owned(),
            ));
        }
        if bcs.forces.is_empty() {
            return Err(TopoError::Goal(
                "no load acts on a free degree of freedom".to_owned(),
            ));
        }

        log::debug!(
            "boundary conditions: {} fixed dofs, {} loaded dofs",
            bcs.fixed.len(),
            bcs.forces.len()
        );
        Ok(bcs)
    }

    /// Dense global load vector
    pub fn force_vector(&self, num_dofs: usize) -> Vec<f64> {
        let mut forces = vec![0.0; num_dofs];
        for (&dof, &value) in &self.forces {
            forces[dof] = value;
        }
        forces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datatypes::Bounds, params::SimpParams};
    use approx::assert_relative_eq;

    /// 5x5 vertex lattice over [0, 4] x [0, 4], z = 0
    fn lattice() -> Mesh {
        let mut positions = Vec::new();
        for j in 0..5 {
            for i in 0..5 {
                positions.extend([i as f64, j as f64, 0.0]);
            }
        }
        Mesh::new(positions)
    }

    fn model() -> FeModel {
        let params = SimpParams {
            nx: 4,
            ny: 4,
            nz: 1,
            ..Default::default()
        };
        let bounds = Bounds::new(Vector3::zeros(), Vector3::new(4.0, 4.0, 0.0));
        FeModel::new(&params, &bounds).unwrap()
    }

    #[test]
    fn force_parameter_variants() {
        let mut goal = Goal::load(vec![0], Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(goal.force(), Vector3::new(1.0, 2.0, 3.0));

        goal.parameters = json::parse(r#"{"y": -100.0}"#).unwrap();
        assert_eq!(goal.force(), Vector3::new(0.0, -100.0, 0.0));

        goal.parameters = JsonValue::new_object();
        assert_eq!(goal.force(), Vector3::new(0.0, -1.0, 0.0));
    }

    #[test]
    fn fix_mask_defaults_to_all_axes() {
        let mut goal = Goal::anchor(vec![0]);
        assert_eq!(goal.fix_mask(), [true; 3]);
        goal.parameters = json::parse(r#"{"fix": [false, true]}"#).unwrap();
        assert_eq!(goal.fix_mask(), [false, true, true]);
    }

    #[test]
    fn load_distribution_preserves_resultant() {
        let model = model();
        let goal = Goal::load(vec![4, 9, 14, 19, 24], Vector3::new(0.3, -7.0, 0.0));
        let markers = extract_goal_markers(&lattice(), &[Goal::anchor(vec![0, 5]), goal], &model);

        let distributed = markers.loads[0].distributed.as_ref().unwrap();
        assert_eq!(distributed.nodes.len(), 5);
        assert_relative_eq!(distributed.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);

        let total: Vector3<f64> = distributed
            .split(&markers.loads[0].force)
            .iter()
            .map(|(_, f)| *f)
            .sum();
        assert_relative_eq!(total, Vector3::new(0.3, -7.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn every_anchor_vertex_is_constrained() {
        let model = model();
        let goals = [Goal::anchor(vec![0, 5, 10, 15, 20]), Goal::load(vec![24], default_load())];
        let markers = extract_goal_markers(&lattice(), &goals, &model);
        let bcs = BoundaryConditions::from_markers(&markers, &model).unwrap();

        assert_eq!(bcs.fixed.len(), 10);
        for j in 0..5 {
            let node = model.node_index(0, j, 0);
            assert!(bcs.fixed.contains(&(2 * node)));
            assert!(bcs.fixed.contains(&(2 * node + 1)));
        }
        assert_eq!(bcs.forces.len(), 1);
        assert_eq!(bcs.forces[&(2 * model.node_index(4, 4, 0) + 1)], -1.0);
    }

    #[test]
    fn fallbacks_when_no_vertices() {
        let model = model();
        let markers = extract_goal_markers(&lattice(), &[], &model);
        assert_eq!(markers.anchors.len(), 1);
        assert_eq!(markers.loads.len(), 1);
        assert_eq!(markers.anchors[0].position, model.bounds.min);
        assert_eq!(markers.loads[0].position, model.bounds.max);
        assert_eq!(markers.loads[0].force, default_load());
    }

    #[test]
    fn load_wins_over_coincident_anchor() {
        let model = model();
        let goals = [Goal::anchor(vec![7]), Goal::load(vec![7], default_load())];
        let markers = extract_goal_markers(&lattice(), &goals, &model);
        // the only anchor was dropped, so the lower-corner fallback does not apply
        assert!(markers.anchors.is_empty());
        assert_eq!(markers.loads.len(), 1);
        assert!(BoundaryConditions::from_markers(&markers, &model).is_err());
    }

    #[test]
    fn shared_vertex_is_removed_from_anchor() {
        let model = model();
        let goals = [Goal::anchor(vec![2, 7]), Goal::load(vec![7, 12], default_load())];
        let markers = extract_goal_markers(&lattice(), &goals, &model);
        let shared = lattice().vertex(7).unwrap();

        assert_eq!(markers.anchors.len(), 1);
        assert_eq!(markers.anchors[0].vertices, vec![2]);
        assert!(!markers.anchors[0].positions.contains(&shared));
        assert!(markers.loads[0].positions.contains(&shared));
    }

    #[test]
    fn fixed_dofs_win_over_forces() {
        let model = model();
        let markers = GoalMarkers {
            anchors: vec![AnchorMarker {
                position: Vector3::zeros(),
                vertices: vec![],
                positions: vec![],
                distributed: None,
                fix: [true, true, true],
            }],
            loads: vec![
                LoadMarker {
                    position: Vector3::new(0.2, 0.1, 0.0),
                    vertices: vec![],
                    positions: vec![],
                    distributed: None,
                    force: default_load(),
                },
                LoadMarker {
                    position: Vector3::new(4.0, 4.0, 0.0),
                    vertices: vec![],
                    positions: vec![],
                    distributed: None,
                    force: Vector3::new(2.0, 0.0, 0.0),
                },
            ],
        };
        let bcs = BoundaryConditions::from_markers(&markers, &model).unwrap();
        assert_eq!(bcs.fixed, BTreeSet::from([0, 1]));
        assert_eq!(bcs.forces.len(), 1);
        let force = bcs.force_vector(model.num_dofs);
        assert_eq!(force.iter().sum::<f64>(), 2.0);
    }

    #[test]
    fn out_of_range_node_is_rejected() {
        let model = model();
        let mut markers = extract_goal_markers(&lattice(), &[], &model);
        markers.loads[0].distributed = Some(DistributedNodes {
            nodes: vec![model.num_nodes],
            weights: vec![1.0],
        });
        assert!(matches!(
            BoundaryConditions::from_markers(&markers, &model),
            Err(TopoError::Goal(_))
        ));
    }
}
