use std::any::Any;

use crossbeam_channel::{unbounded, Receiver, Sender};

type Message = Box<dyn Any + Send>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Worker {0} hung up")]
    Disconnected(usize),
    #[error("Worker {0} sent a message of an unexpected type")]
    UnexpectedMessage(usize),
    #[error("Scatter on worker 0 needs exactly {expected} chunks, got {got}")]
    ScatterSize { expected: usize, got: usize },
}

/// One worker's endpoint in a fixed-size group.
///
/// Every pair of workers shares a dedicated FIFO channel, so messages between
/// two workers arrive in the order they were sent. Worker 0 is the root of all
/// collectives. Every worker must call the same collectives in the same order.
pub struct Comm {
    rank: usize,
    size: usize,
    /// indexed by destination rank
    senders: Vec<Sender<Message>>,
    /// indexed by source rank
    receivers: Vec<Receiver<Message>>,
}

/// Build the endpoints for a group of `size` workers.
pub fn group(size: usize) -> Vec<Comm> {
    let size = size.max(1);
    let mut senders: Vec<Vec<Sender<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
    let mut receivers: Vec<Vec<Receiver<Message>>> =
        (0..size).map(|_| Vec::with_capacity(size)).collect();
    // channel (src -> dst): src keeps the sender at index dst, dst keeps the receiver at index src.
    for src in 0..size {
        for dst in 0..size {
            let (tx, rx) = unbounded();
            senders[src].push(tx);
            receivers[dst].push(rx);
        }
    }
    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (senders, receivers))| Comm {
            rank,
            size,
            senders,
            receivers,
        })
        .collect()
}

impl Comm {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    fn send<T: Send + 'static>(&self, dst: usize, value: T) -> Result<(), Error> {
        self.senders[dst]
            .send(Box::new(value))
            .map_err(|_| Error::Disconnected(dst))
    }

    fn recv<T: 'static>(&self, src: usize) -> Result<T, Error> {
        let msg = self.receivers[src]
            .recv()
            .map_err(|_| Error::Disconnected(src))?;
        msg.downcast::<T>()
            .map(|value| *value)
            .map_err(|_| Error::UnexpectedMessage(src))
    }

    /// Wait until every worker has reached this point.
    pub fn barrier(&self) -> Result<(), Error> {
        self.gather(())?;
        self.broadcast(Some(()))
    }

    /// Root passes `Some(value)`, everyone gets a copy. Other workers' argument is ignored.
    pub fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>) -> Result<T, Error> {
        if self.is_root() {
            let value = value.ok_or(Error::UnexpectedMessage(0))?;
            for dst in 1..self.size {
                self.send(dst, value.clone())?;
            }
            Ok(value)
        } else {
            self.recv(0)
        }
    }

    /// Collect one value from every worker on the root, in rank order.
    /// Non-root workers get `None`.
    pub fn gather<T: Send + 'static>(&self, value: T) -> Result<Option<Vec<T>>, Error> {
        if self.is_root() {
            let mut all = Vec::with_capacity(self.size);
            all.push(value);
            for src in 1..self.size {
                all.push(self.recv(src)?);
            }
            Ok(Some(all))
        } else {
            self.send(0, value)?;
            Ok(None)
        }
    }

    /// Every worker gets every worker's value, in rank order.
    pub fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>, Error> {
        let gathered = self.gather(value)?;
        self.broadcast(gathered)
    }

    /// Root hands chunk `i` to worker `i`; each worker returns its chunk.
    pub fn scatter<T: Send + 'static>(&self, chunks: Option<Vec<T>>) -> Result<T, Error> {
        if self.is_root() {
            let chunks = chunks.ok_or(Error::UnexpectedMessage(0))?;
            if chunks.len() != self.size {
                return Err(Error::ScatterSize {
                    expected: self.size,
                    got: chunks.len(),
                });
            }
            let mut chunks = chunks.into_iter();
            let own = chunks.next().ok_or(Error::UnexpectedMessage(0))?;
            for (dst, chunk) in chunks.enumerate() {
                self.send(dst + 1, chunk)?;
            }
            Ok(own)
        } else {
            self.recv(0)
        }
    }

    /// Logical OR across all workers; everyone gets the same answer.
    pub fn any(&self, flag: bool) -> Result<bool, Error> {
        let flags = self.gather(flag)?;
        self.broadcast(flags.map(|flags| flags.into_iter().any(|f| f)))
    }
}
