//! Consistency checker. The structural rules that every public operation
//! preserves are spelled out here as one read-only scan:
//!
//! 1. Every block reachable from the directory is marked free and its links
//!    form a well threaded doubly linked list in the right size class.
//! 2. No free block has a free physical neighbor, since freeing and growing
//!    merge adjacent free blocks immediately.
//! 3. Walking the heap from the first block to the epilogue, every header
//!    matches its footer, every size is a legal block size, and no footer
//!    reaches into the next block's header.
//! 4. The number of free blocks seen by the heap walk equals the number of
//!    blocks threaded through the directory.
//!
//! [`Heap::verify`] reports everything it finds as [`Violation`] values so
//! tests can assert on exact failures; [`Heap::check`] prints them to stderr
//! and boils the result down to a boolean. The checker never repairs
//! anything.

use std::fmt;

use crate::{
    block::{tag_allocated, tag_size, Block, ALIGNMENT, DSIZE, FIRST_BLOCK, MIN_BLOCK_SIZE, WSIZE},
    directory::{size_class, NIL, NUM_LISTS},
    heap::Heap,
};

/// One broken structural rule, with enough context to locate the damage.
/// Offsets are byte offsets of block payloads from the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A block threaded through the directory has its allocation bit set.
    AllocatedInFreeList { block: usize, class: usize },
    /// A free block touches another free block, which coalescing forbids.
    AdjacentFreeBlocks { block: usize, neighbor: usize },
    /// Header and footer of a block disagree.
    MismatchedTags { block: usize, header: u32, footer: u32 },
    /// A block size below the minimum or not a multiple of the alignment.
    MalformedSize { block: usize, size: usize },
    /// A block's footer reaches past the start of the next block's header,
    /// or the walk ran off the end of the region.
    OverlappingBlocks { block: usize, next: usize },
    /// The prev/next links of a free list do not thread back and forth
    /// consistently, or the list appears to be cyclic.
    BadFreeLink { block: usize, class: usize },
    /// A free block sits in a list that its size does not map to.
    WrongSizeClass { block: usize, size: usize, class: usize },
    /// The heap walk and the directory disagree on how many blocks are free.
    FreeCountMismatch { walked: usize, listed: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::AllocatedInFreeList { block, class } => {
                write!(f, "block at offset {block} in free list {class} is marked allocated")
            }
            Violation::AdjacentFreeBlocks { block, neighbor } => {
                write!(f, "free block at offset {block} is adjacent to free block at offset {neighbor}")
            }
            Violation::MismatchedTags { block, header, footer } => {
                write!(f, "block at offset {block} has header {header:#x} but footer {footer:#x}")
            }
            Violation::MalformedSize { block, size } => {
                write!(f, "block at offset {block} has invalid size {size}")
            }
            Violation::OverlappingBlocks { block, next } => {
                write!(f, "block at offset {block} overlaps the block at offset {next}")
            }
            Violation::BadFreeLink { block, class } => {
                write!(f, "broken link at block offset {block} in free list {class}")
            }
            Violation::WrongSizeClass { block, size, class } => {
                write!(f, "free block at offset {block} of size {size} is threaded in list {class}")
            }
            Violation::FreeCountMismatch { walked, listed } => {
                write!(f, "heap walk found {walked} free blocks but the directory lists {listed}")
            }
        }
    }
}

impl Heap {
    /// Scans the whole heap and returns every violation found. An empty
    /// result means all invariants hold. A heap that was never initialized
    /// is trivially consistent.
    pub fn verify(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        if !self.is_initialized() {
            return violations;
        }

        // No heap can thread more lists entries than blocks that fit in it,
        // which bounds the scan even over a corrupted cyclic list.
        let max_blocks = self.size() / MIN_BLOCK_SIZE + 1;
        let mut listed = 0;

        unsafe {
            for class in 0..NUM_LISTS {
                let mut prev = NIL;
                let mut cursor = self.head(class);
                let mut steps = 0;

                while cursor != NIL {
                    let block = Block::at_payload(cursor);
                    listed += 1;
                    steps += 1;

                    // A corrupted list could be cyclic or point anywhere.
                    // Refuse to follow links that leave the payload region
                    // or outnumber the blocks that could possibly exist.
                    if steps > max_blocks
                        || cursor < FIRST_BLOCK
                        || cursor + MIN_BLOCK_SIZE - WSIZE > self.size()
                    {
                        violations.push(Violation::BadFreeLink { block: cursor, class });
                        break;
                    }

                    if self.is_allocated(block) {
                        violations.push(Violation::AllocatedInFreeList { block: cursor, class });
                        // The link words of an allocated block are user
                        // data. Stop before chasing them.
                        break;
                    }

                    if self.prev_free(block) != prev {
                        violations.push(Violation::BadFreeLink { block: cursor, class });
                    }

                    let size = self.size_of(block);

                    if size < MIN_BLOCK_SIZE
                        || size % ALIGNMENT != 0
                        || cursor + size - WSIZE > self.size()
                    {
                        violations.push(Violation::MalformedSize { block: cursor, size });
                        break;
                    }

                    if size_class(size) != class {
                        violations.push(Violation::WrongSizeClass { block: cursor, size, class });
                    }

                    // The word right before the header is the left
                    // neighbor's footer; the word right before the next
                    // payload is the right neighbor's header. Their
                    // allocation bits are all the adjacency check needs.
                    let left_footer = self.word(cursor - DSIZE);
                    if !tag_allocated(left_footer) {
                        violations.push(Violation::AdjacentFreeBlocks {
                            block: cursor,
                            neighbor: cursor.saturating_sub(tag_size(left_footer)),
                        });
                    }

                    let right_header = self.word(cursor + size - WSIZE);
                    if !tag_allocated(right_header) {
                        violations.push(Violation::AdjacentFreeBlocks {
                            block: cursor,
                            neighbor: cursor + size,
                        });
                    }

                    prev = cursor;
                    cursor = self.next_free(block);
                }
            }

            let mut walked = 0;
            let mut block = Block::at_payload(FIRST_BLOCK);

            loop {
                if block.header() + WSIZE > self.size() {
                    violations.push(Violation::OverlappingBlocks {
                        block: block.payload(),
                        next: self.size(),
                    });
                    break;
                }

                let header = self.word(block.header());
                let size = tag_size(header);

                if size == 0 {
                    // The genuine epilogue sits exactly at the break.
                    if block.payload() != self.size() {
                        violations.push(Violation::MalformedSize {
                            block: block.payload(),
                            size,
                        });
                    }
                    break;
                }

                if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
                    violations.push(Violation::MalformedSize {
                        block: block.payload(),
                        size,
                    });
                    // Navigation cannot be trusted past a bad size.
                    break;
                }

                if block.footer(size) + WSIZE > self.size() {
                    violations.push(Violation::OverlappingBlocks {
                        block: block.payload(),
                        next: block.payload() + size,
                    });
                    break;
                }

                let footer = self.word(block.footer(size));
                if footer != header {
                    violations.push(Violation::MismatchedTags {
                        block: block.payload(),
                        header,
                        footer,
                    });
                }

                if !tag_allocated(header) {
                    walked += 1;
                }

                block = self.next_block(block);
            }

            if walked != listed {
                violations.push(Violation::FreeCountMismatch { walked, listed });
            }
        }

        violations
    }

    /// Runs [`Heap::verify`], prints every violation to stderr and returns
    /// whether the heap passed.
    pub fn check(&self) -> bool {
        let violations = self.verify();

        for violation in &violations {
            eprintln!("{violation}");
        }

        violations.is_empty()
    }
}
