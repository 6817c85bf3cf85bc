//! Wire protocol: topic schema and typed payloads

mod payload;
mod topics;

pub use payload::{
    Announcement, IndexAssignment, Inbound, encode_announcement, encode_done, encode_flag, encode_index,
    encode_observation, encode_reward, parse_action, parse_announcement, parse_done, parse_flag, parse_index,
    parse_observation, parse_reward,
};
pub use topics::{ANNOUNCE_TOPIC, Channel, INDEX_TOPIC, MASTER_STATUS_TOPIC, TopicKey};
