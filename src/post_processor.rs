use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::{
    datatypes::{DensityField, RenderMesh, SolverFrame},
    error::{Result, TopoError},
};

fn create(path: &Path) -> Result<BufWriter<File>> {
    match File::create(path) {
        Ok(f) => Ok(BufWriter::new(f)),
        Err(err) => Err(TopoError::Output(format!(
            "Failed to create {}: {err}",
            path.display()
        ))),
    }
}

/// Writes the voxel densities to a CSV file
///
/// # Arguments
/// * `field` - The density field to write
/// * `output` - The path of the output csv
pub fn write_density_csv(field: &DensityField, output: &Path) -> Result<()> {
    let mut file = create(output)?;

    writeln!(file, "i,j,k,density")?;
    for k in 0..field.nz {
        for j in 0..field.ny {
            for i in 0..field.nx {
                writeln!(file, "{i},{j},{k},{d}", d = field.get(i, j, k))?;
            }
        }
    }
    file.flush()?;

    log::info!("wrote densities to {}", output.display());
    Ok(())
}

/// Writes a reconstructed surface as a Wavefront OBJ file
///
/// # Arguments
/// * `mesh` - The surface to write
/// * `output` - The path of the output obj
pub fn write_obj(mesh: &RenderMesh, output: &Path) -> Result<()> {
    if !mesh.is_consistent() {
        return Err(TopoError::Output(
            "refusing to write an inconsistent mesh".to_owned(),
        ));
    }
    let mut file = create(output)?;

    writeln!(file, "# voxtopo surface")?;
    for p in mesh.positions.chunks_exact(3) {
        writeln!(file, "v {} {} {}", p[0], p[1], p[2])?;
    }
    for uv in mesh.uvs.chunks_exact(2) {
        writeln!(file, "vt {} {}", uv[0], uv[1])?;
    }
    for n in mesh.normals.chunks_exact(3) {
        writeln!(file, "vn {} {} {}", n[0], n[1], n[2])?;
    }

    let has_uvs = !mesh.uvs.is_empty();
    let has_normals = !mesh.normals.is_empty();
    for tri in mesh.indices.chunks_exact(3) {
        let corner = |i: u32| -> String {
            let i = i + 1;
            match (has_uvs, has_normals) {
                (true, true) => format!("{i}/{i}/{i}"),
                (true, false) => format!("{i}/{i}"),
                (false, true) => format!("{i}//{i}"),
                (false, false) => format!("{i}"),
            }
        };
        writeln!(file, "f {} {} {}", corner(tri[0]), corner(tri[1]), corner(tri[2]))?;
    }
    file.flush()?;

    log::info!(
        "wrote {} triangles to {}",
        mesh.triangle_count(),
        output.display()
    );
    Ok(())
}

/// Writes the per-iteration metrics of a run as a JSON array
pub fn write_history(frames: &[SolverFrame], output: &Path) -> Result<()> {
    let mut file = create(output)?;
    serde_json::to_writer_pretty(&mut file, frames)?;
    file.flush()?;
    Ok(())
}
