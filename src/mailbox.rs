//! Per-process mailboxes: a bounded queue of datagram-style messages,
//! written by other processes and drained by the owner.

use crate::param::{MAX_MAIL_IN_BOX, MAX_MAIL_LENGTH};

pub struct Mailbox {
    /// Index of the oldest message.
    head: usize,

    /// Number of queued messages.
    count: usize,

    lengths: [usize; MAX_MAIL_IN_BOX],
    messages: [[u8; MAX_MAIL_LENGTH]; MAX_MAIL_IN_BOX],
}

impl Mailbox {
    pub const fn zero() -> Self {
        Self {
            head: 0,
            count: 0,
            lengths: [0; MAX_MAIL_IN_BOX],
            messages: [[0; MAX_MAIL_LENGTH]; MAX_MAIL_IN_BOX],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == MAX_MAIL_IN_BOX
    }

    /// Queue a message. Zero-length messages are legal.
    pub fn push(&mut self, msg: &[u8]) -> Result<usize, ()> {
        if msg.len() > MAX_MAIL_LENGTH || self.is_full() {
            return Err(());
        }
        let slot = (self.head + self.count) % MAX_MAIL_IN_BOX;
        self.messages[slot][..msg.len()].copy_from_slice(msg);
        self.lengths[slot] = msg.len();
        self.count += 1;
        Ok(msg.len())
    }

    /// Dequeue the oldest message into `dst`, truncating to fit. The whole
    /// message is consumed either way. Returns the copied length, or `None`
    /// when the box is empty.
    pub fn pop(&mut self, dst: &mut [u8]) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let slot = self.head;
        let n = self.lengths[slot].min(dst.len());
        dst[..n].copy_from_slice(&self.messages[slot][..n]);
        self.head = (self.head + 1) % MAX_MAIL_IN_BOX;
        self.count -= 1;
        Some(n)
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_truncation() {
        let mut mbox = Mailbox::zero();
        mbox.push(b"first").unwrap();
        mbox.push(b"second message").unwrap();

        let mut buf = [0u8; MAX_MAIL_LENGTH];
        assert_eq!(mbox.pop(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"first");

        // A short buffer truncates but still consumes the message.
        let mut tiny = [0u8; 3];
        assert_eq!(mbox.pop(&mut tiny).unwrap(), 3);
        assert_eq!(&tiny, b"sec");
        assert!(mbox.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut mbox = Mailbox::zero();
        for _ in 0..MAX_MAIL_IN_BOX {
            mbox.push(b"x").unwrap();
        }
        assert!(mbox.is_full());
        assert!(mbox.push(b"overflow").is_err());

        let mut buf = [0u8; 1];
        mbox.pop(&mut buf).unwrap();
        assert!(mbox.push(b"fits again").is_ok());
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let mut mbox = Mailbox::zero();
        let big = [0u8; MAX_MAIL_LENGTH + 1];
        assert!(mbox.push(&big).is_err());
        assert!(mbox.is_empty());
    }

    #[test]
    fn zero_length_mail_is_delivered() {
        let mut mbox = Mailbox::zero();
        mbox.push(b"").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(mbox.pop(&mut buf).unwrap(), 0);
    }
}
