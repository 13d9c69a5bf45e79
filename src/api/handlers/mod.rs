pub mod photo;
pub mod system;

use rocket::Route;

pub fn generate_photo_routes() -> Vec<Route> {
    routes![
        photo::upload,
        photo::get_photo,
        photo::list_photos,
        photo::delete_photo,
    ]
}

pub fn generate_system_routes() -> Vec<Route> {
    routes![system::list_executions]
}
