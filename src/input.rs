//! Problem files: the input mesh, its goals and the optimizer parameters.
//!
//! ```json
//! {
//!     "mesh": { "positions": [0, 0, 0, 40, 0, 0, 40, 20, 0, 0, 20, 0] },
//!     "goals": [
//!         { "type": "anchor", "vertices": [0, 3] },
//!         { "type": "load", "vertices": [2], "parameters": { "force": [0, -1, 0] } }
//!     ],
//!     "params": { "nx": 40, "ny": 20, "vol_frac": 0.4 }
//! }
//! ```

use json::JsonValue;

use crate::{
    boundary::{Goal, GoalKind},
    datatypes::Mesh,
    error::{Result, TopoError},
    params::SimpParams,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub mesh: Mesh,
    pub goals: Vec<Goal>,
    pub params: SimpParams,
}

/// Loads and checks the top level structure of a problem file
fn load_input_file(input_file: &str) -> Result<JsonValue> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(f) => f,
        Err(err) => {
            return Err(TopoError::Input(format!(
                "Unable to open input file {}: {}",
                input_file, err
            )))
        }
    };
    parse_input(&file_string)
}

fn parse_input(text: &str) -> Result<JsonValue> {
    let input_json = match json::parse(text) {
        Ok(f) => f,
        Err(err) => return Err(TopoError::Input(format!("Error in input file json: {err}"))),
    };

    if !input_json.has_key("mesh") {
        return Err(TopoError::Input("Input json missing mesh field".to_string()));
    }
    if !input_json["mesh"].has_key("positions") {
        return Err(TopoError::Input(
            "Input json missing positions field in mesh section".to_string(),
        ));
    }
    if !input_json.has_key("goals") {
        return Err(TopoError::Input("Input json missing goals field".to_string()));
    }

    Ok(input_json)
}

fn parse_mesh(input_json: &JsonValue) -> Result<Mesh> {
    let positions = &input_json["mesh"]["positions"];
    if !positions.is_array() || positions.len() % 3 != 0 {
        return Err(TopoError::Input(
            "mesh positions must be a flat array of xyz triples".to_owned(),
        ));
    }

    let values = positions
        .members()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| TopoError::Input(format!("mesh position {i} is not a finite number")))
        })
        .collect::<Result<Vec<f64>>>()?;

    Ok(Mesh::new(values))
}

fn parse_goal(index: usize, goal_json: &JsonValue) -> Result<Goal> {
    let kind = match goal_json["type"].as_str() {
        Some("anchor") => GoalKind::Anchor,
        Some("load") => GoalKind::Load,
        Some(other) => {
            return Err(TopoError::Goal(format!(
                "goal {index} has unknown type '{other}'"
            )))
        }
        None => return Err(TopoError::Goal(format!("goal {index} is missing its type"))),
    };

    let vertices = goal_json["vertices"]
        .members()
        .map(|v| {
            v.as_usize()
                .ok_or_else(|| TopoError::Goal(format!("goal {index} has a non-index vertex {v}")))
        })
        .collect::<Result<Vec<usize>>>()?;

    let parameters = if goal_json["parameters"].is_object() {
        goal_json["parameters"].clone()
    } else {
        JsonValue::new_object()
    };

    Ok(Goal {
        kind,
        vertices,
        parameters,
    })
}

/// Optimizer parameters go through serde so every field keeps its default
fn parse_params(input_json: &JsonValue) -> Result<SimpParams> {
    let params_json = &input_json["params"];
    if params_json.is_null() {
        return Ok(SimpParams::default());
    }
    let params: SimpParams = serde_json::from_str(&params_json.dump())?;
    params.validate()?;
    Ok(params)
}

fn parse_problem(input_json: &JsonValue) -> Result<Problem> {
    let mesh = parse_mesh(input_json)?;
    let goals = input_json["goals"]
        .members()
        .enumerate()
        .map(|(i, g)| parse_goal(i, g))
        .collect::<Result<Vec<Goal>>>()?;
    let params = parse_params(input_json)?;

    log::info!(
        "loaded problem with {} vertices and {} goals",
        mesh.vertex_count(),
        goals.len()
    );
    Ok(Problem {
        mesh,
        goals,
        params,
    })
}

/// Reads a problem file from disk
pub fn load_problem(input_file: &str) -> Result<Problem> {
    parse_problem(&load_input_file(input_file)?)
}

/// Parses a problem from JSON text
pub fn parse_problem_str(text: &str) -> Result<Problem> {
    parse_problem(&parse_input(text)?)
}
