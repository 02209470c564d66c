// Timer adapter implementations and the callback delivery bridge

pub mod beat;
pub mod worker;
