pub mod coordinate_mapper;
pub mod detection;
pub mod jog;
pub mod nms;
pub mod path_planner;
pub mod stage_controller;
pub mod stage_protocol;
pub mod tiling;
pub mod transport;
pub mod traversal;
