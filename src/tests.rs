mod services;
mod timers;
mod wire;
