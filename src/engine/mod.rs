pub mod cache;
pub mod consumer;
pub mod queue;
pub mod store;

// Writes never touch the database on the request path. An API server
// publishes each checkbox action to the queue, partitioned by checkbox number,
// and returns as soon as the queue has accepted it. Actions on one checkbox
// are therefore totally ordered, while actions on different checkboxes are
// free to interleave.

// The consumer is the only writer. It pulls a batch, fans each message out to
// a worker chosen by partition, and waits for every message in the batch to
// finish before pulling again. Routing by partition keeps the per-checkbox
// order the queue hands out, and waiting on the whole batch means a slow
// message throttles the poll loop rather than piling up behind it. A message
// is only deleted after its transaction commits, so a crash anywhere before
// that point turns into a redelivery, and redeliveries are absorbed by the
// request id recorded alongside each checkbox.

// Reads never touch the database either. Each API server holds every checkbox
// in a flat array of atomics, loaded in bulk at startup and converging on the
// store through periodic reloads. A consumer sharing a process with the cache
// also writes through to it after each commit.
