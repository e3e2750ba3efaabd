//! Built-in scene used when no scene file is given

use glam::{Mat4, Quat, Vec3};

use super::mesh::{Mesh, MeshInstances};

/// A `columns` x `rows` grid on the XZ plane, cubes and pyramids alternating
/// like a checkerboard. The grid is centred on X and extends away from the
/// default camera along -Z.
pub fn demo_scene(columns: u32, rows: u32, spacing: f32) -> Vec<MeshInstances> {
    let mut cubes = Vec::new();
    let mut pyramids = Vec::new();
    let half_width = (columns.saturating_sub(1)) as f32 * spacing * 0.5;

    for row in 0..rows {
        for column in 0..columns {
            let position = Vec3::new(
                column as f32 * spacing - half_width,
                0.0,
                -(row as f32) * spacing,
            );
            let spin = Quat::from_rotation_y((row * columns + column) as f32 * 0.35);
            let model = Mat4::from_rotation_translation(spin, position);

            if (row + column) % 2 == 0 {
                cubes.push(model);
            } else {
                pyramids.push(model);
            }
        }
    }

    vec![
        MeshInstances::new(Mesh::cube(), cubes),
        MeshInstances::new(Mesh::pyramid(), pyramids),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneBatch;

    #[test]
    fn test_checkerboard_split() {
        let scene = demo_scene(5, 4, 2.0);
        assert_eq!(scene.len(), 2);
        assert_eq!(scene[0].instance_count, 10);
        assert_eq!(scene[1].instance_count, 10);
        for entry in &scene {
            assert!(entry.validate().is_ok());
        }
    }

    #[test]
    fn test_grid_is_centred_on_x() {
        let scene = demo_scene(3, 1, 4.0);
        let xs: Vec<f32> = scene
            .iter()
            .flat_map(|entry| entry.instance_model_matrices.iter().map(|m| m.w_axis.x))
            .collect();
        assert!(xs.contains(&-4.0));
        assert!(xs.contains(&0.0));
        assert!(xs.contains(&4.0));
    }

    #[test]
    fn test_batches_into_two_draws() {
        let batch = SceneBatch::build(&demo_scene(8, 8, 3.0)).unwrap();
        assert_eq!(batch.draw_commands.len(), 2);
        assert_eq!(batch.instance_count(), 64);
        assert_eq!(batch.draw_commands[1].first_instance, 32);
    }
}
