mod coalescing;
mod deferred;
