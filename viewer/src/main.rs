use bevy::prelude::*;
use procgen_viewer::ProcgenPlugin;

fn main() {
    App::new()
        .insert_resource(ClearColor(Color::rgb(0.53, 0.81, 0.92)))
        .add_plugins(DefaultPlugins.set(WindowPlugin {
            primary_window: Some(Window {
                title: "Procgen Viewer".into(),
                resolution: (1280.0, 720.0).into(),
                resizable: true,
                ..default()
            }),
            ..default()
        }))
        .add_plugins(ProcgenPlugin::default())
        .add_systems(Startup, setup_camera)
        .run();
}

fn setup_camera(mut commands: Commands) {
    commands.spawn(Camera3dBundle {
        transform: Transform::from_xyz(9.0, 28.0, 30.0).looking_at(Vec3::new(9.0, 4.0, -4.0), Vec3::Y),
        ..default()
    });
}
